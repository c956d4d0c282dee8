/// Storage engine: the authoritative per-topic value store.
///
/// Each topic owns a [`StorageRecord`] holding its current value, the
/// sequence number of the last applied update, and a bounded history deque
/// consumed by queued readers. Records live in a sharded concurrent map, so
/// writers to independent topics never contend on the same lock.
///
/// # Ordering
///
/// - Local writes always apply and always take a fresh sequence number, so a
///   local writer wins against stale echoes coming back from the network.
/// - Remote writes apply only if their timestamp is not older than the stored
///   value's. Equal timestamps apply in arrival order.
/// - Sequence numbers come from one engine-wide counter: strictly increasing
///   per topic and never reused, even after a topic is cleared.
use crate::error::{TableError, TableResult};
use crate::handle::{ConnectionId, TopicHandle};
use crate::value::{Value, ValueKind};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default history depth kept per topic.
pub const DEFAULT_HISTORY_DEPTH: usize = 20;

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOrigin {
    /// An application thread on this instance.
    Local,
    /// A peer, identified by its connection.
    Remote(ConnectionId),
}

impl WriteOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, WriteOrigin::Local)
    }
}

/// Result of a write attempt that passed type checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The value is now current, with this sequence number.
    Applied(u64),
    /// The value was older than the stored one and was dropped.
    Stale,
    /// Duplicate suppression dropped a value equal to the current one.
    Unchanged,
}

/// One stored update.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryItem {
    pub value: Value,
    pub sequence: u64,
}

/// Per-topic storage.
#[derive(Debug, Clone)]
pub struct StorageRecord {
    pub value: Value,
    pub sequence: u64,
    pub history: VecDeque<HistoryItem>,
    pub depth: usize,
}

impl StorageRecord {
    fn new(depth: usize) -> Self {
        Self {
            value: Value::empty(),
            sequence: 0,
            history: VecDeque::new(),
            depth,
        }
    }

    fn push(&mut self, item: HistoryItem) {
        self.history.push_back(item);
        while self.history.len() > self.depth {
            self.history.pop_front();
        }
    }
}

/// Thread-safe storage for all topics of one instance.
#[derive(Debug)]
pub struct StorageEngine {
    records: DashMap<TopicHandle, StorageRecord>,
    next_sequence: AtomicU64,
    default_depth: usize,
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_HISTORY_DEPTH)
    }

    /// Create an engine keeping `depth` history items per topic by default.
    pub fn with_depth(depth: usize) -> Self {
        Self {
            records: DashMap::new(),
            next_sequence: AtomicU64::new(1),
            default_depth: depth.max(1),
        }
    }

    fn sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Store a value for `topic`, whose bound type is `bound`.
    ///
    /// `topic_name` only feeds error messages. With `keep_duplicates` unset a
    /// value equal to the current one is dropped as [`SetOutcome::Unchanged`].
    pub fn set_value(
        &self,
        topic: TopicHandle,
        topic_name: &str,
        bound: ValueKind,
        value: Value,
        origin: WriteOrigin,
        keep_duplicates: bool,
    ) -> TableResult<SetOutcome> {
        if value.is_empty() {
            return Err(TableError::invalid_data(format!(
                "cannot store an empty value in '{}'",
                topic_name
            )));
        }
        if value.kind() != bound {
            return Err(TableError::TypeMismatch {
                topic: topic_name.to_string(),
                expected: bound.to_string(),
                actual: value.kind().to_string(),
            });
        }

        let mut record = self
            .records
            .entry(topic)
            .or_insert_with(|| StorageRecord::new(self.default_depth));

        if !record.value.is_empty() {
            if !origin.is_local() && value.time() < record.value.time() {
                tracing::trace!(
                    topic = topic_name,
                    incoming = value.time(),
                    stored = record.value.time(),
                    "dropping stale remote update"
                );
                return Ok(SetOutcome::Stale);
            }
            if !keep_duplicates && record.value == value {
                // Keep the newer timestamp so later stale checks see it.
                if value.time() > record.value.time() {
                    record.value = value;
                }
                return Ok(SetOutcome::Unchanged);
            }
        }

        let sequence = self.sequence();
        record.sequence = sequence;
        record.value = value.clone();
        record.push(HistoryItem { value, sequence });
        Ok(SetOutcome::Applied(sequence))
    }

    /// Current value, or the empty sentinel if never published.
    pub fn get_value(&self, topic: TopicHandle) -> Value {
        self.records
            .get(&topic)
            .map(|record| record.value.clone())
            .unwrap_or_default()
    }

    /// Sequence number of the current value, 0 if none.
    pub fn last_sequence(&self, topic: TopicHandle) -> u64 {
        self.records
            .get(&topic)
            .map(|record| record.sequence)
            .unwrap_or(0)
    }

    /// Updates with a sequence number greater than `since`, oldest first.
    ///
    /// If `since` predates the oldest retained update the result starts at the
    /// oldest one still available.
    pub fn get_history(&self, topic: TopicHandle, since: u64) -> Vec<HistoryItem> {
        self.records
            .get(&topic)
            .map(|record| {
                record
                    .history
                    .iter()
                    .filter(|item| item.sequence > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Grow the history depth of `topic` to at least `depth`.
    pub fn ensure_depth(&self, topic: TopicHandle, depth: usize) {
        let mut record = self
            .records
            .entry(topic)
            .or_insert_with(|| StorageRecord::new(self.default_depth));
        if depth > record.depth {
            record.depth = depth;
        }
    }

    /// Drop a topic's value and history. Sequence numbers are not reset.
    pub fn clear(&self, topic: TopicHandle) {
        if let Some(mut record) = self.records.get_mut(&topic) {
            record.value = Value::empty();
            record.history.clear();
        }
    }

    /// Number of topics holding a value.
    pub fn value_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| !record.value.is_empty())
            .count()
    }
}
