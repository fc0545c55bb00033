//! Totally ordered log sequence identifier: the replication clock.

use std::fmt;
use std::str::FromStr;

use crate::utils::MetaError;

use get_size::GetSize;
use serde::{Deserialize, Serialize};

/// `(epoch, view, seq)` triple identifying one log position. The derived
/// ordering is lexicographic on the fields in declaration order, which is
/// exactly the replication total order.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize,
    Deserialize, GetSize,
)]
pub struct LogSeq {
    /// Reconfiguration era; bumped when a config record commits.
    pub epoch: i64,

    /// View number within the epoch; bumped by view changes.
    pub view: i64,

    /// Record sequence within the view.
    pub seq: i64,
}

impl LogSeq {
    /// Distinguished minimum denoting "no log".
    pub const NONE: LogSeq = LogSeq {
        epoch: -1,
        view: -1,
        seq: -1,
    };

    /// The first assignable sequence.
    pub const START: LogSeq = LogSeq {
        epoch: 0,
        view: 0,
        seq: 0,
    };

    /// Creates a sequence from parts.
    pub fn new(epoch: i64, view: i64, seq: i64) -> Self {
        LogSeq { epoch, view, seq }
    }

    /// All components non-negative.
    pub fn is_valid(&self) -> bool {
        self.epoch >= 0 && self.view >= 0 && self.seq >= 0
    }

    /// The next sequence within the same view.
    pub fn next(self) -> LogSeq {
        LogSeq {
            seq: self.seq + 1,
            ..self
        }
    }

    /// The start of the following view in the same epoch.
    pub fn next_view(self) -> LogSeq {
        LogSeq {
            epoch: self.epoch,
            view: self.view + 1,
            seq: 0,
        }
    }

    /// The start of the following epoch.
    pub fn next_epoch(self) -> LogSeq {
        LogSeq {
            epoch: self.epoch + 1,
            view: 0,
            seq: 0,
        }
    }

    /// Whether two sequences fall in the same `(epoch, view)`.
    pub fn in_same_view(&self, other: &LogSeq) -> bool {
        self.epoch == other.epoch && self.view == other.view
    }

    /// Number of records between two positions of the same view;
    /// `i64::MAX` when the positions live in different views (forcing the
    /// caller down the checkpoint-sync path rather than in-view catch-up).
    pub fn seq_distance(&self, other: &LogSeq) -> i64 {
        if self.in_same_view(other) {
            (self.seq - other.seq).abs()
        } else {
            i64::MAX
        }
    }
}

impl Default for LogSeq {
    fn default() -> Self {
        LogSeq::NONE
    }
}

impl fmt::Display for LogSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.epoch, self.view, self.seq)
    }
}

impl FromStr for LogSeq {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_ascii_whitespace();
        let mut next = || -> Result<i64, MetaError> {
            Ok(tokens
                .next()
                .ok_or_else(|| {
                    MetaError(format!("invalid log seq '{}'", s))
                })?
                .parse()?)
        };
        let parsed = LogSeq {
            epoch: next()?,
            view: next()?,
            seq: next()?,
        };
        Ok(parsed)
    }
}
