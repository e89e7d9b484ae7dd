//! Sortable 128-bit task identifiers.
//!
//! A `TaskId` embeds its creation time in the high bits so that the
//! lexicographic order of encoded ids equals creation order. The generator is
//! seeded from the last persisted id on startup, so ids stay strictly
//! increasing across process restarts even if the clock moves backwards.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::now_epoch_ms;

/// Bit layout: 48-bit unix-ms timestamp | 16-bit sequence | 64-bit random tail.
const TIMESTAMP_SHIFT: u32 = 80;
const SEQUENCE_SHIFT: u32 = 64;
const TIMESTAMP_MASK: u64 = 0xFFFF_FFFF_FFFF;

#[derive(Debug, Clone, Error)]
pub enum TaskIdParseError {
    #[error("task id must be 32 hex characters, got {0} characters")]
    Length(usize),
    #[error("task id is not valid hex: {0}")]
    Hex(String),
}

/// A 128-bit, lexicographically sortable task identifier.
///
/// Encoded as 32 fixed-width lowercase hex characters, so byte order of the
/// encoding equals numeric order of the id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TaskId(u128);

impl TaskId {
    pub fn from_parts(timestamp_ms: u64, sequence: u16, random: u64) -> Self {
        let ts = (timestamp_ms & TIMESTAMP_MASK) as u128;
        TaskId((ts << TIMESTAMP_SHIFT) | ((sequence as u128) << SEQUENCE_SHIFT) | random as u128)
    }

    pub const fn from_u128(raw: u128) -> Self {
        TaskId(raw)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// The unix-ms creation time embedded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) as u64
    }

    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, TaskIdParseError> {
        if s.len() != 32 {
            return Err(TaskIdParseError::Length(s.len()));
        }
        u128::from_str_radix(s, 16)
            .map(TaskId)
            .map_err(|e| TaskIdParseError::Hex(e.to_string()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.to_hex())
    }
}

impl FromStr for TaskId {
    type Err = TaskIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskId::from_hex(s)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> String {
        id.to_hex()
    }
}

impl TryFrom<String> for TaskId {
    type Error = TaskIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        TaskId::from_hex(&s)
    }
}

/// Strictly monotonic id generator.
///
/// Seeded with the highest id ever persisted; `generate` never returns an id
/// less than or equal to a previously issued or seeded one.
pub struct TaskIdGenerator {
    last: Mutex<u128>,
}

impl TaskIdGenerator {
    pub fn new(seed: Option<TaskId>) -> Self {
        TaskIdGenerator {
            last: Mutex::new(seed.map(|id| id.as_u128()).unwrap_or(0)),
        }
    }

    pub fn generate(&self) -> TaskId {
        let candidate =
            TaskId::from_parts(now_epoch_ms(), 0, rand::thread_rng().gen::<u64>()).as_u128();
        let mut last = self.last.lock().unwrap();
        // Same-millisecond pressure or a rewound clock: bump past the previous id.
        let next = if candidate <= *last { *last + 1 } else { candidate };
        *last = next;
        TaskId(next)
    }

    pub fn last_issued(&self) -> Option<TaskId> {
        let last = *self.last.lock().unwrap();
        (last > 0).then_some(TaskId(last))
    }
}
