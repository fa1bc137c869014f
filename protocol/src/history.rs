//! Append-only log of lock state transitions.

use crate::{
    clock::Instant,
    frame::{Command, Frame, LockId},
    lock::{LockState, Transition},
};
use alloc::{collections::vec_deque::VecDeque, string::String};
use core::fmt::{Display, Formatter};
use serde::{Serialize, Serializer};

/// What caused a transition.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Trigger {
    /// The actuator acknowledged a command.
    Acknowledged(Command),
    /// The actuator rejected a command with the given code.
    Rejected(Command, String),
    /// An event or status frame.
    Frame(Frame),
    /// A grace period ran out without corroboration.
    GraceExpired,
}

impl Display for Trigger {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Acknowledged(cmd) => write!(f, "{cmd} -> {}", Frame::Ok),
            Self::Rejected(cmd, code) => write!(f, "{cmd} -> {}", Frame::Error(code.clone())),
            Self::Frame(frame) => write!(f, "{frame}"),
            Self::GraceExpired => write!(f, "grace period expired"),
        }
    }
}

impl Serialize for Trigger {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One logged transition.
#[derive(Serialize, PartialEq, Eq, Clone, Debug)]
pub struct HistoryEntry {
    /// Time of the transition.
    pub at: Instant,
    /// Affected lock.
    pub lock: LockId,
    /// State before.
    pub from: LockState,
    /// State after.
    pub to: LockState,
    /// Cause of the transition.
    pub trigger: Trigger,
}

/// Default number of entries kept in memory.
pub const HISTORY_LEN: usize = 256;

/// Append-only transition log.
///
/// Entries are never modified. Only the most recent `capacity` entries are
/// kept in memory, every entry is also published to the mirror.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    total: u64,
}

impl History {
    /// Constructs an empty log keeping [`HISTORY_LEN`] entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_LEN)
    }

    /// Constructs an empty log keeping at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    /// Appends a transition and returns the new entry.
    ///
    /// The oldest entry is forgotten once the log is full.
    pub fn append(&mut self, transition: Transition, trigger: Trigger) -> &HistoryEntry {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }

        self.entries.push_back(HistoryEntry {
            at: transition.at,
            lock: transition.lock,
            from: transition.from,
            to: transition.to,
            trigger,
        });
        self.total += 1;

        &self.entries[self.entries.len() - 1]
    }

    /// Returns the retained entries, oldest first.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    /// Returns the retained entries of a single lock, oldest first.
    pub fn for_lock(&self, lock: LockId) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.entries.iter().filter(move |e| e.lock == lock)
    }

    /// Returns the number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was logged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries appended since construction.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}
