//! Space accounting between reclaimed records and growing headers.
//!
//! Two lanes, never both non-zero:
//!
//! - `expunged_space`: bytes freed by removed records that later records
//!   have not yet been shifted over (the gap).
//! - `space_diff`: while a rewrite run is pending, the signed balance of the
//!   run's region. Negative means the run still owes bytes.
//!
//! A run starts at the first record whose header cannot be rewritten in
//! place or into the gap, and settles as soon as its balance reaches zero.

use tracing::{debug, trace};

use crate::error::{MboxError, Result};

/// Padding reserved per regenerated header so small future changes fit.
pub const HEADER_PADDING: u64 = 50;

/// A record as the ledger sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    Live {
        seq: u32,
        /// Current header length.
        old: u64,
        /// Length of the regenerated header without padding.
        min: u64,
        /// The header must be regenerated.
        rewrite: bool,
    },
    Expunged { seq: u32, space: u64 },
    Pseudo,
}

/// What to do with the record just accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave it where it is.
    Untouched,
    /// Regenerate the header within its current length.
    InPlace,
    /// Move the record back by `by` bytes, letting the header grow by `grow`.
    Shift { by: u64, grow: u64 },
    /// Part of a pending run; written when the run settles.
    Defer,
    /// Removed; its bytes joined the gap or the pending run.
    Reclaim,
}

/// A run whose balance reached zero and can be written now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub first_seq: u32,
    pub last_seq: u32,
    /// Bytes to spread as header padding over the run's live records.
    pub padding: u64,
    /// Bytes left over at the end of the region; they become the gap.
    pub leftover: u64,
}

/// Settlement at end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Nothing,
    /// Cut `gap` bytes off the end.
    Truncate { gap: u64 },
    /// Grow the file by `deficit + padding` and write the pending run.
    Grow {
        deficit: u64,
        padding: u64,
        first_seq: u32,
    },
}

#[derive(Debug, Default)]
pub struct SpaceLedger {
    expunged_space: u64,
    space_diff: i64,
    need_space_seq: Option<u32>,
    /// Live records in the pending run.
    absorbers: u64,
}

impl SpaceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expunged_space(&self) -> u64 {
        self.expunged_space
    }

    pub fn space_diff(&self) -> i64 {
        self.space_diff
    }

    /// First record of the pending run.
    pub fn need_space_seq(&self) -> Option<u32> {
        self.need_space_seq
    }

    pub fn run_active(&self) -> bool {
        self.need_space_seq.is_some()
    }

    /// No gap and no pending run: records ahead are still where they were.
    pub fn is_idle(&self) -> bool {
        !self.run_active() && self.expunged_space == 0
    }

    pub fn accumulate(&mut self, entry: LedgerEntry) -> Result<(Decision, Option<Settlement>)> {
        trace!(?entry, gap = self.expunged_space, diff = self.space_diff, "Accumulate");
        match entry {
            LedgerEntry::Pseudo => {
                if !self.is_idle() {
                    return Err(MboxError::SpaceAccounting(
                        "placeholder record after reclaimed space".into(),
                    ));
                }
                Ok((Decision::Untouched, None))
            }
            LedgerEntry::Expunged { seq, space } => {
                if self.run_active() {
                    self.space_diff += to_signed(space)?;
                    if self.space_diff >= 0 {
                        let budget = self.space_diff as u64;
                        let padding = budget.min(HEADER_PADDING * self.absorbers);
                        let settlement = self.settle(seq, padding, budget - padding);
                        return Ok((Decision::Reclaim, Some(settlement)));
                    }
                } else {
                    self.expunged_space += space;
                }
                Ok((Decision::Reclaim, None))
            }
            LedgerEntry::Live {
                seq,
                old,
                min,
                rewrite,
            } => {
                if self.run_active() {
                    self.space_diff += to_signed(old)? - to_signed(min)?;
                    self.absorbers += 1;
                    if self.space_diff >= 0 {
                        let padding = self.space_diff as u64;
                        let settlement = self.settle(seq, padding, 0);
                        return Ok((Decision::Defer, Some(settlement)));
                    }
                    return Ok((Decision::Defer, None));
                }

                let gap = self.expunged_space;
                if !rewrite || min <= old {
                    let decision = match (gap, rewrite) {
                        (0, false) => Decision::Untouched,
                        (0, true) => Decision::InPlace,
                        (by, _) => Decision::Shift { by, grow: 0 },
                    };
                    return Ok((decision, None));
                }

                let deficit = min - old;
                if deficit <= gap {
                    let take = gap.min(deficit + HEADER_PADDING);
                    self.expunged_space -= take;
                    return Ok((Decision::Shift { by: gap, grow: take }, None));
                }

                // Not enough room: start a run that absorbs the gap.
                self.space_diff = to_signed(gap)? - to_signed(deficit)?;
                self.expunged_space = 0;
                self.need_space_seq = Some(seq);
                self.absorbers = 1;
                debug!(seq, deficit, gap, "Header rewrite deferred");
                Ok((Decision::Defer, None))
            }
        }
    }

    /// End of file: what remains to be done with the gap or pending run.
    pub fn finish(&mut self) -> Finish {
        if let Some(first_seq) = self.need_space_seq.take() {
            let deficit = self.space_diff.unsigned_abs();
            let padding = HEADER_PADDING * self.absorbers;
            self.space_diff = 0;
            self.absorbers = 0;
            debug!(first_seq, deficit, padding, "Growing file for pending run");
            return Finish::Grow {
                deficit,
                padding,
                first_seq,
            };
        }
        let gap = std::mem::take(&mut self.expunged_space);
        if gap > 0 {
            Finish::Truncate { gap }
        } else {
            Finish::Nothing
        }
    }

    fn settle(&mut self, last_seq: u32, padding: u64, leftover: u64) -> Settlement {
        let first_seq = self.need_space_seq.take().unwrap_or(last_seq);
        self.space_diff = 0;
        self.absorbers = 0;
        self.expunged_space = leftover;
        debug!(first_seq, last_seq, padding, leftover, "Rewrite run settled");
        Settlement {
            first_seq,
            last_seq,
            padding,
            leftover,
        }
    }
}

fn to_signed(n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| MboxError::SpaceAccounting(format!("byte count {n} overflows")))
}
