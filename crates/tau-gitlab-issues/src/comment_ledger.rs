//! In-process de-duplication ledger for comments mirrored between GitLab and Matrix.
//!
//! Every comment id that has crossed the bridge (in either direction) is
//! recorded under its `(instance, project, issue, comment)` key. The inbound
//! webhook path test-and-marks before delivering, and the outbound path marks
//! the freshly created comment id so the echo webhook is discarded.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// Minimum age before a bounded ledger may evict an entry.
pub const DEFAULT_LEDGER_MIN_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identity of one mirrored comment.
pub struct CommentLedgerKey {
    pub instance: String,
    pub project_path: String,
    pub issue_iid: String,
    pub comment_id: String,
}

impl CommentLedgerKey {
    pub fn new(
        instance: impl Into<String>,
        project_path: impl Into<String>,
        issue_iid: impl Into<String>,
        comment_id: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            project_path: project_path.into(),
            issue_iid: issue_iid.into(),
            comment_id: comment_id.into(),
        }
    }

    /// Compact rendering used in log fields.
    pub fn as_event_key(&self) -> String {
        format!(
            "{}:{}#{}:{}",
            self.instance, self.project_path, self.issue_iid, self.comment_id
        )
    }
}

/// Trait contract for comment de-duplication stores.
///
/// Implementations must be safe to share between connections and concurrent
/// handler tasks. `mark_processed` is a test-and-set: it returns `true` only
/// for the call that inserted the key.
pub trait CommentLedger: Send + Sync {
    fn has_been_processed(&self, key: &CommentLedgerKey) -> bool;

    fn mark_processed(&self, key: &CommentLedgerKey) -> bool;
}

#[derive(Debug, Default)]
struct LedgerEntries {
    next_sequence: u64,
    by_key: HashMap<CommentLedgerKey, LedgerMark>,
    by_recency: BTreeMap<u64, CommentLedgerKey>,
}

#[derive(Debug, Clone, Copy)]
struct LedgerMark {
    sequence: u64,
    marked_at: Instant,
}

#[derive(Debug)]
/// `Mutex`-guarded ledger with an optional least-recently-marked bound.
pub struct InMemoryCommentLedger {
    capacity: Option<usize>,
    min_retention: Duration,
    entries: Mutex<LedgerEntries>,
}

impl Default for InMemoryCommentLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCommentLedger {
    /// Unbounded ledger: entries live for the lifetime of the process.
    pub fn new() -> Self {
        Self {
            capacity: None,
            min_retention: DEFAULT_LEDGER_MIN_RETENTION,
            entries: Mutex::new(LedgerEntries::default()),
        }
    }

    /// Bounded ledger. Entries beyond `capacity` are evicted oldest-mark first,
    /// but never before they are `min_retention` old; the ledger grows past
    /// `capacity` instead.
    pub fn with_capacity(capacity: usize, min_retention: Duration) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            min_retention,
            entries: Mutex::new(LedgerEntries::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_processed_at(&self, key: &CommentLedgerKey, now: Instant) -> bool {
        let mut entries = self.lock_entries();
        let sequence = entries.next_sequence;
        entries.next_sequence = entries.next_sequence.saturating_add(1);

        if let Some(existing) = entries.by_key.get(key).copied() {
            entries.by_recency.remove(&existing.sequence);
            entries.by_recency.insert(sequence, key.clone());
            entries.by_key.insert(
                key.clone(),
                LedgerMark {
                    sequence,
                    marked_at: now,
                },
            );
            return false;
        }

        entries.by_key.insert(
            key.clone(),
            LedgerMark {
                sequence,
                marked_at: now,
            },
        );
        entries.by_recency.insert(sequence, key.clone());
        self.evict_expired(&mut entries, now);
        true
    }

    fn evict_expired(&self, entries: &mut LedgerEntries, now: Instant) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while entries.by_key.len() > capacity {
            let Some((&oldest_sequence, oldest_key)) = entries.by_recency.iter().next() else {
                break;
            };
            let Some(mark) = entries.by_key.get(oldest_key).copied() else {
                break;
            };
            if now.saturating_duration_since(mark.marked_at) < self.min_retention {
                break;
            }
            let oldest_key = oldest_key.clone();
            entries.by_recency.remove(&oldest_sequence);
            entries.by_key.remove(&oldest_key);
            tracing::debug!(
                comment = %oldest_key.as_event_key(),
                capacity,
                "evicted comment ledger entry"
            );
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, LedgerEntries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CommentLedger for InMemoryCommentLedger {
    fn has_been_processed(&self, key: &CommentLedgerKey) -> bool {
        self.lock_entries().by_key.contains_key(key)
    }

    fn mark_processed(&self, key: &CommentLedgerKey) -> bool {
        self.mark_processed_at(key, Instant::now())
    }
}
