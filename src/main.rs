//! CLI entry point for `mboxsync`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mboxsync::config::Config;
use mboxsync::index::reader as index_reader;
use mboxsync::index::store::{index_file_size, IndexRecord, MailIndex};
use mboxsync::model::flags::{is_valid_keyword, MailFlags};
use mboxsync::model::sync_record::{parse_uid_set, SyncKind, SyncRecord};
use mboxsync::parser::header::display_field;
use mboxsync::parser::mbox::RecordScanner;
use mboxsync::sync::{Mailbox, SyncFlags, SyncReport};

#[derive(Parser)]
#[command(
    name = "mboxsync",
    version,
    about = "Keep an mbox mailbox and its message index in sync",
    long_about = "Assigns stable UIDs to the messages of an mbox file, writes flag, \
                  keyword and UID headers back into it, and removes expunged messages \
                  while moving as few bytes as possible."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only update the index; header rewrites wait for `sync --full-write`
    #[arg(long, global = true)]
    lazy: bool,

    /// Directory for index files instead of next to the mailbox
    #[arg(long, global = true, value_name = "DIR", env = "MBOXSYNC_INDEX_DIR")]
    index_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize a mailbox with its index
    Sync {
        path: PathBuf,
        /// Rescan every message, also clears a corrupted index
        #[arg(long)]
        force_full: bool,
        /// Write deferred header changes
        #[arg(long)]
        full_write: bool,
        /// Do not use cached offsets after an external change
        #[arg(long)]
        undirty: bool,
        #[arg(long)]
        json: bool,
    },
    /// List messages with their UIDs, flags and keywords
    List {
        path: PathBuf,
        #[command(flatten)]
        opts: ReadOpts,
    },
    /// Show index statistics
    Stats {
        path: PathBuf,
        #[command(flatten)]
        opts: ReadOpts,
    },
    /// Add or remove flags (seen, answered, flagged, deleted, draft)
    Flag {
        path: PathBuf,
        /// UID set, e.g. `1:5,7,10:*`
        uids: String,
        #[arg(short, long, value_name = "FLAG")]
        add: Vec<String>,
        #[arg(short, long, value_name = "FLAG")]
        remove: Vec<String>,
        #[command(flatten)]
        write: WriteOpts,
    },
    /// Add, remove or clear keywords
    Keyword {
        path: PathBuf,
        uids: String,
        #[arg(short, long, value_name = "KEYWORD")]
        add: Vec<String>,
        #[arg(short, long, value_name = "KEYWORD")]
        remove: Vec<String>,
        /// Drop every keyword before adding
        #[arg(long)]
        reset: bool,
        #[command(flatten)]
        write: WriteOpts,
    },
    /// Remove messages from the mailbox
    Expunge {
        path: PathBuf,
        uids: String,
        #[command(flatten)]
        write: WriteOpts,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Args)]
struct ReadOpts {
    /// Use the index as it is, without syncing first
    #[arg(long)]
    no_sync: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct WriteOpts {
    /// Queue the change; the next sync applies it
    #[arg(long)]
    no_sync: bool,
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = mboxsync::config::load_config();
    if cli.lazy {
        config.sync.lazy_writes = true;
    }
    if cli.index_dir.is_some() {
        config.index.index_dir = cli.index_dir.clone();
    }

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Sync {
            path,
            force_full,
            full_write,
            undirty,
            json,
        } => {
            let mut flags = SyncFlags::empty();
            flags.set(SyncFlags::FORCE_FULL, force_full);
            flags.set(SyncFlags::FULL_WRITE, full_write);
            flags.set(SyncFlags::UNDIRTY, undirty);
            cmd_sync(&path, &config, flags, json)
        }
        Commands::List { path, opts } => cmd_list(&path, &config, &opts),
        Commands::Stats { path, opts } => cmd_stats(&path, &config, &opts),
        Commands::Flag {
            path,
            uids,
            add,
            remove,
            write,
        } => {
            let add = parse_flags(&add)?;
            let remove = parse_flags(&remove)?;
            if add.is_empty() && remove.is_empty() {
                anyhow::bail!("nothing to change: use --add or --remove");
            }
            cmd_queue(&path, &config, &uids, &write, &[SyncKind::Flags { add, remove }])
        }
        Commands::Keyword {
            path,
            uids,
            add,
            remove,
            reset,
            write,
        } => {
            if let Some(bad) = add.iter().chain(&remove).find(|k| !is_valid_keyword(k)) {
                anyhow::bail!("invalid keyword: {bad}");
            }
            if add.is_empty() && remove.is_empty() && !reset {
                anyhow::bail!("nothing to change: use --add, --remove or --reset");
            }
            let mut kinds = Vec::new();
            if reset {
                kinds.push(SyncKind::KeywordReset);
            }
            kinds.extend(remove.into_iter().map(SyncKind::KeywordRemove));
            kinds.extend(add.into_iter().map(SyncKind::KeywordAdd));
            cmd_queue(&path, &config, &uids, &write, &kinds)
        }
        Commands::Expunge { path, uids, write } => {
            cmd_queue(&path, &config, &uids, &write, &[SyncKind::Expunge])
        }
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = mboxsync::config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mboxsync.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mboxsync", &mut std::io::stdout());
    Ok(())
}

fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────

fn open_mailbox(path: &Path, config: &Config) -> anyhow::Result<Mailbox> {
    if !path.exists() {
        anyhow::bail!("file not found: {}", path.display());
    }
    Ok(Mailbox::open(path, config)?)
}

/// Run a sync with a progress bar on stderr.
fn sync_with_bar(mbox: &mut Mailbox, flags: SyncFlags) -> anyhow::Result<SyncReport> {
    let file_size = std::fs::metadata(mbox.path())?.len();
    let pb = ProgressBar::new(file_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Syncing [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );
    let report = mbox.sync_with_progress(
        flags,
        Some(&|current, total| {
            pb.set_length(total);
            pb.set_position(current);
        }),
    );
    pb.finish_and_clear();
    Ok(report?)
}

fn cmd_sync(path: &Path, config: &Config, flags: SyncFlags, json: bool) -> anyhow::Result<()> {
    let mut mbox = open_mailbox(path, config)?;
    let start = Instant::now();
    let report = sync_with_bar(&mut mbox, flags)?;
    let elapsed = start.elapsed();

    if json {
        let out = serde_json::json!({
            "file": path.to_string_lossy(),
            "elapsed_ms": elapsed.as_millis(),
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(path, &report, elapsed);
    }
    Ok(())
}

fn cmd_queue(
    path: &Path,
    config: &Config,
    uids: &str,
    write: &WriteOpts,
    kinds: &[SyncKind],
) -> anyhow::Result<()> {
    let mut mbox = open_mailbox(path, config)?;
    if !write.no_sync {
        // UIDs must be current before a set like `5:*` is resolved.
        sync_with_bar(&mut mbox, SyncFlags::empty())?;
    }
    let last_uid = mbox.index().header().next_uid.saturating_sub(1);
    let ranges = parse_uid_set(uids, last_uid)?;
    let mut queued = 0;
    for (uid1, uid2) in ranges {
        for kind in kinds {
            mbox.queue(SyncRecord::new(uid1, uid2, kind.clone())?)?;
            queued += 1;
        }
    }

    let report = if write.no_sync {
        None
    } else {
        Some(sync_with_bar(&mut mbox, SyncFlags::empty())?)
    };

    if write.json {
        let out = serde_json::json!({
            "file": path.to_string_lossy(),
            "queued": queued,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if let Some(report) = report {
        println!(
            "  {} change(s) applied, {} header(s) rewritten, {} message(s) expunged",
            queued, report.headers_rewritten, report.expunged
        );
    } else {
        println!("  {queued} change(s) queued for the next sync");
    }
    Ok(())
}

fn cmd_list(path: &Path, config: &Config, opts: &ReadOpts) -> anyhow::Result<()> {
    let mut mbox = open_mailbox(path, config)?;
    if !opts.no_sync {
        sync_with_bar(&mut mbox, SyncFlags::empty())?;
    }

    let mut scanner = RecordScanner::new(mbox.file())?;
    let mut rows = Vec::with_capacity(mbox.index().records().len());
    for record in mbox.index().records() {
        let subject = match scanner.seek_to_offset(record.from_offset) {
            Ok(()) => scanner
                .next()?
                .and_then(|rec| display_field(&rec.header, "Subject"))
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!(uid = record.uid, error = %e, "Stale offset");
                String::new()
            }
        };
        rows.push((record, subject));
    }

    if opts.json {
        let out: Vec<serde_json::Value> = rows
            .iter()
            .map(|(r, subject)| {
                serde_json::json!({
                    "uid": r.uid,
                    "flags": r.flags.names(),
                    "keywords": r.keywords,
                    "offset": r.from_offset,
                    "dirty": r.flags.contains(MailFlags::DIRTY),
                    "subject": subject,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_list_table(&rows);
    }
    Ok(())
}

fn cmd_stats(path: &Path, config: &Config, opts: &ReadOpts) -> anyhow::Result<()> {
    let mut mbox = open_mailbox(path, config)?;
    if !opts.no_sync {
        sync_with_bar(&mut mbox, SyncFlags::empty())?;
    }
    let file_size = std::fs::metadata(path)?.len();
    let idx_size = index_file_size(path, config.index.index_dir.as_deref());
    let stats = index_reader::index_stats(mbox.index(), 10);

    if opts.json {
        let out = serde_json::json!({
            "file": path.to_string_lossy(),
            "file_size": file_size,
            "index_size": idx_size,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    use humansize::{format_size, BINARY};
    println!();
    println!("  {:<20} {}", "File:", path.display());
    println!("  {:<20} {}", "File size:", format_size(file_size, BINARY));
    if idx_size > 0 {
        println!("  {:<20} {}", "Index size:", format_size(idx_size, BINARY));
    }
    println!("  {:<20} {}", "Messages:", stats.messages);
    println!("  {:<20} {}", "UID validity:", stats.uid_validity);
    println!("  {:<20} {}", "Next UID:", stats.next_uid);
    if let Some((lo, hi)) = stats.uid_range {
        println!("  {:<20} {lo}..{hi}", "UID range:");
    }
    println!("  {:<20} {}", "Unseen:", stats.unseen);
    println!("  {:<20} {}", "Flagged:", stats.flagged);
    println!("  {:<20} {}", "Deleted:", stats.deleted);
    println!("  {:<20} {}", "Recent:", stats.recent);
    if stats.dirty > 0 {
        println!("  {:<20} {}", "Awaiting write:", stats.dirty);
    }
    if stats.pending_syncs > 0 {
        println!("  {:<20} {}", "Queued changes:", stats.pending_syncs);
    }
    if stats.corrupted {
        println!("  {:<20} yes (run `sync --force-full`)", "Corrupted:");
    }
    if !stats.top_keywords.is_empty() {
        println!();
        println!("  Top keywords:");
        for (kw, count) in &stats.top_keywords {
            println!("    {count:>6}  {kw}");
        }
    }
    println!();
    Ok(())
}

// ── Output ──────────────────────────────────────────────────────

fn parse_flags(names: &[String]) -> anyhow::Result<MailFlags> {
    let mut flags = MailFlags::empty();
    for name in names {
        match MailFlags::from_name(name) {
            Some(flag) => flags |= flag,
            None => anyhow::bail!("unknown flag: {name}"),
        }
    }
    Ok(flags)
}

fn print_report(path: &Path, report: &SyncReport, elapsed: std::time::Duration) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {:<20} {}", "File:", path.display());
    let mode = match (report.mode, report.index_only) {
        (_, true) => "index only".to_string(),
        (Some(mode), _) => format!("{mode:?}"),
        (None, _) => "up to date".to_string(),
    };
    println!("  {:<20} {mode}", "Sync:");
    if report.attempts > 1 {
        println!("  {:<20} {}", "Attempts:", report.attempts);
    }
    println!("  {:<20} {}", "Messages scanned:", report.records_scanned);
    println!("  {:<20} {}", "New messages:", report.appended);
    println!("  {:<20} {}", "Headers rewritten:", report.headers_rewritten);
    println!("  {:<20} {}", "Expunged:", report.expunged);
    if report.vanished > 0 {
        println!("  {:<20} {}", "Removed externally:", report.vanished);
    }
    if report.renumbered {
        println!("  {:<20} new UID validity {}", "Renumbered:", report.uid_validity);
    }
    println!(
        "  {:<20} {} -> {}",
        "Size:",
        format_size(report.size_before, BINARY),
        format_size(report.size_after, BINARY)
    );
    println!("  {:<20} {:.2?}", "Time:", elapsed);
    println!();
}

fn print_list_table(rows: &[(&IndexRecord, String)]) {
    println!("{:>8}  {:<24}  {:<20}  Subject", "UID", "Flags", "Keywords");
    for (record, subject) in rows {
        let mut flags = record.flags.names().join(" ");
        if record.flags.contains(MailFlags::DIRTY) {
            flags.push('*');
        }
        println!(
            "{:>8}  {:<24}  {:<20}  {}",
            record.uid,
            flags,
            record.keywords.join(" "),
            subject
        );
    }
}
