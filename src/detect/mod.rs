//! Change classification for worker results.

use crate::worker::{WorkerOutcome, WorkerResult};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Change {
    pub changed: bool,
    pub delta: i64,
}

impl Change {
    pub const NONE: Change = Change {
        changed: false,
        delta: 0,
    };
}

/// Compare a result against the previously observed item count.
///
/// Only successful runs can report a change: a failed or timed-out run
/// carries `item_count = 0` and must not read as "everything disappeared".
pub fn classify(previous: u64, result: &WorkerResult) -> Change {
    if result.outcome != WorkerOutcome::Success {
        return Change::NONE;
    }
    let wide = i128::from(result.item_count) - i128::from(previous);
    let delta = i64::try_from(wide).unwrap_or(if wide > 0 { i64::MAX } else { i64::MIN });
    Change {
        changed: result.item_count != previous,
        delta,
    }
}
