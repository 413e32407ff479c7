//! Managed status headers.
//!
//! The sync engine owns a handful of header fields and regenerates them in a
//! fixed order after all other ("unmanaged") header lines:
//!
//! ```text
//! <unmanaged header lines, verbatim>
//! X-IMAPbase: <uid validity> <last uid, 10 digits>      (first message only)
//! Status: RO
//! X-Status: AFTD                                        (only if any are set)
//! X-Keywords: kw1 kw2<padding spaces>
//! X-UID: <uid>
//! Content-Length: <body length>
//! <blank line>
//! ```
//!
//! Trailing spaces after the keywords are padding: header growth eats into
//! them before the message has to be moved.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::model::flags::MailFlags;

/// Width of the zero-padded last-UID field.
pub const UID_LAST_WIDTH: usize = 10;

/// Size of the header digest used to recognize messages without `X-UID`.
pub const DIGEST_LEN: usize = 16;

/// Header digest.
pub type HeaderDigest = [u8; DIGEST_LEN];

/// Subject of the placeholder record.
pub const PSEUDO_SUBJECT: &str = "DON'T DELETE THIS MESSAGE -- FOLDER INTERNAL DATA";

/// Mailbox-wide metadata from `X-IMAPbase` or `X-IMAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseInfo {
    pub validity: u32,
    pub uid_last: u32,
    /// Offset of the last-UID digits inside the header bytes, when the field
    /// has exactly [`UID_LAST_WIDTH`] digits and can be patched in place.
    pub uid_last_pos: Option<usize>,
}

/// Managed fields pulled out of a raw header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub uid: Option<u32>,
    /// Header flags; [`MailFlags::RECENT`] when `Status` lacks `O`.
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    /// Trailing spaces on the `X-Keywords` line.
    pub keywords_padding: usize,
    pub base: Option<BaseInfo>,
    /// The base came from `X-IMAP`: this is the placeholder record.
    pub pseudo: bool,
    pub content_length: Option<u64>,
    /// All other header lines, verbatim, each ending in a newline.
    pub unmanaged: Vec<u8>,
    pub digest: HeaderDigest,
    /// The block ended with a blank line.
    pub has_eoh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Managed {
    Uid,
    Status,
    XStatus,
    Keywords,
    Base,
    Imap,
    ContentLength,
}

fn managed_field(name: &[u8]) -> Option<Managed> {
    let name = name.trim_ascii();
    [
        (&b"X-UID"[..], Managed::Uid),
        (b"Status", Managed::Status),
        (b"X-Status", Managed::XStatus),
        (b"X-Keywords", Managed::Keywords),
        (b"X-IMAPbase", Managed::Base),
        (b"X-IMAP", Managed::Imap),
        (b"Content-Length", Managed::ContentLength),
    ]
    .into_iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, m)| m)
}

/// A header field: first line plus continuation lines.
struct Field<'a> {
    start: usize,
    bytes: &'a [u8],
}

/// Split a header block into fields. Stops at the blank line.
fn split_fields(header: &[u8]) -> (Vec<Field<'_>>, bool) {
    let mut fields: Vec<Field<'_>> = Vec::new();
    let mut pos = 0;
    while pos < header.len() {
        let end = header[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(header.len());
        let line = &header[pos..end];
        if is_empty_line(line) {
            return (fields, true);
        }
        let continuation = matches!(line.first(), Some(b' ' | b'\t'));
        match fields.last_mut() {
            Some(last) if continuation => {
                last.bytes = &header[last.start..end];
            }
            _ => fields.push(Field {
                start: pos,
                bytes: line,
            }),
        }
        pos = end;
    }
    (fields, false)
}

/// Parse a header block (`[hdr_offset, body_offset)` of a record).
pub fn parse_header(header: &[u8]) -> ParsedHeader {
    let (fields, has_eoh) = split_fields(header);

    let mut parsed = ParsedHeader {
        uid: None,
        flags: MailFlags::RECENT,
        keywords: Vec::new(),
        keywords_padding: 0,
        base: None,
        pseudo: false,
        content_length: None,
        unmanaged: Vec::with_capacity(header.len()),
        digest: [0; DIGEST_LEN],
        has_eoh,
    };
    let mut status_seen = false;
    let mut hasher = Sha256::new();

    for field in &fields {
        let colon = field.bytes.iter().position(|&b| b == b':');
        let managed = colon.and_then(|c| managed_field(&field.bytes[..c]));
        let Some((kind, colon)) = managed.zip(colon) else {
            parsed.unmanaged.extend_from_slice(field.bytes);
            if !field.bytes.ends_with(b"\n") {
                parsed.unmanaged.push(b'\n');
            }
            for line in field.bytes.split(|&b| b == b'\n') {
                let line = line.trim_ascii_end();
                if !line.is_empty() {
                    hasher.update(line);
                    hasher.update(b"\n");
                }
            }
            continue;
        };
        let raw_value = &field.bytes[colon + 1..];
        let value = raw_value.trim_ascii();

        match kind {
            Managed::Uid => {
                if parsed.uid.is_none() {
                    parsed.uid = parse_u32(value).filter(|&u| u != 0);
                }
            }
            Managed::Status => {
                if !status_seen {
                    status_seen = true;
                    let keep = parsed.flags & !(MailFlags::SEEN | MailFlags::RECENT);
                    parsed.flags = keep | MailFlags::from_status(value);
                }
            }
            Managed::XStatus => parsed.flags |= MailFlags::from_x_status(value),
            Managed::Keywords => {
                parsed.keywords = String::from_utf8_lossy(value)
                    .split_ascii_whitespace()
                    .map(str::to_string)
                    .collect();
                let line = raw_value.strip_suffix(b"\n").unwrap_or(raw_value);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                parsed.keywords_padding = line.len() - line.trim_ascii_end().len();
            }
            Managed::Base | Managed::Imap => {
                if parsed.base.is_none() {
                    let value_start = field.start + colon + 1;
                    parsed.base = parse_base(raw_value, value_start);
                    parsed.pseudo = kind == Managed::Imap && parsed.base.is_some();
                }
            }
            Managed::ContentLength => {
                parsed.content_length = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse().ok());
            }
        }
    }

    let hash = hasher.finalize();
    parsed.digest.copy_from_slice(&hash[..DIGEST_LEN]);
    parsed
}

/// Parse `<validity> <uid_last> [keywords...]`; `value_start` is the
/// offset of `raw` inside the header block.
fn parse_base(raw: &[u8], value_start: usize) -> Option<BaseInfo> {
    let mut tokens = Vec::with_capacity(2);
    let mut i = 0;
    while i < raw.len() && tokens.len() < 2 {
        if raw[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        while i < raw.len() && !raw[i].is_ascii_whitespace() {
            i += 1;
        }
        tokens.push((start, &raw[start..i]));
    }
    let (_, validity) = tokens.first()?;
    let validity = parse_u32(validity)?;
    let (uid_last, uid_last_pos) = match tokens.get(1) {
        Some((start, tok)) => {
            let n = parse_u32(tok)?;
            let patchable = tok.len() == UID_LAST_WIDTH && tok.iter().all(u8::is_ascii_digit);
            (n, patchable.then_some(value_start + start))
        }
        None => (0, None),
    };
    Some(BaseInfo {
        validity,
        uid_last,
        uid_last_pos,
    })
}

fn parse_u32(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Declared `Content-Length`, if any. Cheaper than a full [`parse_header`].
pub fn find_content_length(header: &[u8]) -> Option<u64> {
    header
        .split(|&b| b == b'\n')
        .take_while(|line| !line.trim_ascii().is_empty())
        .find_map(|line| {
            let colon = line.iter().position(|&b| b == b':')?;
            if !line[..colon].eq_ignore_ascii_case(b"Content-Length") {
                return None;
            }
            std::str::from_utf8(line[colon + 1..].trim_ascii())
                .ok()?
                .parse()
                .ok()
        })
}

/// A line consisting only of a line ending.
pub fn is_empty_line(line: &[u8]) -> bool {
    line == b"\n" || line == b"\r\n"
}

// ── Rendering ───────────────────────────────────────────────────

/// Everything needed to regenerate a header block.
#[derive(Debug, Clone, Copy)]
pub struct HeaderFields<'a> {
    pub unmanaged: &'a [u8],
    /// `(uid validity, last uid)` when this message carries `X-IMAPbase`.
    pub base: Option<(u32, u32)>,
    pub flags: MailFlags,
    pub keywords: &'a [String],
    pub uid: u32,
    pub content_length: u64,
}

/// A regenerated header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    /// Offset of the last-UID digits inside `bytes`.
    pub uid_last_pos: Option<usize>,
}

/// Render the header with `padding` spaces after the keywords.
pub fn render_header(fields: &HeaderFields<'_>, padding: usize) -> Rendered {
    let mut out = Vec::with_capacity(fields.unmanaged.len() + 160 + padding);
    out.extend_from_slice(fields.unmanaged);

    let mut uid_last_pos = None;
    if let Some((validity, uid_last)) = fields.base {
        out.extend_from_slice(format!("X-IMAPbase: {validity} ").as_bytes());
        uid_last_pos = Some(out.len());
        out.extend_from_slice(format!("{uid_last:010}\n").as_bytes());
    }

    out.extend_from_slice(format!("Status: {}\n", fields.flags.status_value()).as_bytes());
    if let Some(x_status) = fields.flags.x_status_value() {
        out.extend_from_slice(format!("X-Status: {x_status}\n").as_bytes());
    }

    out.extend_from_slice(b"X-Keywords:");
    for kw in fields.keywords {
        out.push(b' ');
        out.extend_from_slice(kw.as_bytes());
    }
    out.resize(out.len() + padding, b' ');
    out.push(b'\n');

    out.extend_from_slice(format!("X-UID: {}\n", fields.uid).as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\n", fields.content_length).as_bytes());
    out.push(b'\n');

    Rendered {
        bytes: out,
        uid_last_pos,
    }
}

/// Length of the header rendered without any padding.
pub fn min_header_len(fields: &HeaderFields<'_>) -> u64 {
    render_header(fields, 0).bytes.len() as u64
}

/// Build the placeholder record written when a mailbox loses all messages.
///
/// `uid_last_pos` of the result is relative to the start of the record.
pub fn pseudo_record(validity: u32, uid_last: u32, hostname: &str, now: DateTime<Utc>) -> Rendered {
    let mut out = Vec::with_capacity(640);
    out.extend_from_slice(format!("From MAILER_DAEMON {}\n", now.format("%a %b %e %H:%M:%S %Y")).as_bytes());
    out.extend_from_slice(format!("Date: {}\n", now.to_rfc2822()).as_bytes());
    out.extend_from_slice(
        format!("From: Mail System Internal Data <MAILER-DAEMON@{hostname}>\n").as_bytes(),
    );
    out.extend_from_slice(format!("Subject: {PSEUDO_SUBJECT}\n").as_bytes());
    out.extend_from_slice(format!("Message-ID: <{}@{hostname}>\n", now.timestamp()).as_bytes());
    out.extend_from_slice(format!("X-IMAP: {validity} ").as_bytes());
    let uid_last_pos = out.len();
    out.extend_from_slice(format!("{uid_last:010}\n").as_bytes());
    out.extend_from_slice(b"Status: RO\n\n");
    out.extend_from_slice(
        b"This text is part of the internal format of your mail folder, and is not\n\
          a real message.  It is created automatically by the mail system software.\n\
          If deleted, important folder data will be lost, and it will be re-created\n\
          with the data reset to initial values.\n\n",
    );
    Rendered {
        bytes: out,
        uid_last_pos: Some(uid_last_pos),
    }
}

// ── Display decoding ────────────────────────────────────────────

/// First value of header `name`, unfolded and with RFC 2047 words decoded.
pub fn display_field(header: &[u8], name: &str) -> Option<String> {
    let (fields, _) = split_fields(header);
    fields.iter().find_map(|field| {
        let colon = field.bytes.iter().position(|&b| b == b':')?;
        if !field.bytes[..colon].trim_ascii().eq_ignore_ascii_case(name.as_bytes()) {
            return None;
        }
        let raw = decode_header_bytes(&field.bytes[colon + 1..]);
        let unfolded = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        Some(decode_encoded_words(&unfolded))
    })
}

/// Raw header bytes as text: UTF-8 when valid, Windows-1252 otherwise.
fn decode_header_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => encoding_rs::WINDOWS_1252.decode(bytes).0.into_owned(),
    }
}

/// Decode `=?charset?B|Q?text?=` words; anything undecodable is kept as is.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut prev_was_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        match decode_one_word(candidate) {
            Some((decoded, consumed)) => {
                // Whitespace between two encoded words is dropped.
                if !(prev_was_word && before.trim().is_empty()) {
                    out.push_str(before);
                }
                out.push_str(&decoded);
                rest = &candidate[consumed..];
                prev_was_word = true;
            }
            None => {
                out.push_str(before);
                out.push_str("=?");
                rest = &candidate[2..];
                prev_was_word = false;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode one encoded word at the start of `s`; returns the text and bytes consumed.
fn decode_one_word(s: &str) -> Option<(String, usize)> {
    let inner = s.strip_prefix("=?")?;
    let mut parts = inner.splitn(3, '?');
    let charset = parts.next()?;
    let encoding = parts.next()?;
    let tail = parts.next()?;
    let end = tail.find("?=")?;
    let text = &tail[..end];
    if text.contains(' ') {
        return None;
    }
    let bytes = match encoding {
        "B" | "b" => decode_base64(text)?,
        "Q" | "q" => decode_q(text),
        _ => return None,
    };
    let label = charset.split('*').next().unwrap_or(charset);
    let decoded = match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(enc) => enc.decode(&bytes).0.into_owned(),
        None => {
            warn!(charset = label, "Unknown charset, falling back to UTF-8 lossy");
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };
    let consumed = 2 + charset.len() + 1 + encoding.len() + 1 + end + 2;
    Some((decoded, consumed))
}

fn decode_q(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

fn decode_base64(text: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a' + 26) as u32),
            b'0'..=b'9' => Some((c - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let mut out = Vec::with_capacity(text.len() * 3 / 4);
    let mut acc = 0u32;
    let mut bits = 0;
    for &c in text.as_bytes().iter().filter(|&&c| c != b'=') {
        acc = (acc << 6) | value(c)?;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Some(out)
}
