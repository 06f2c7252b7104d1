//! Store trait: the abstract interface for the local record store.
//!
//! Records and the replication log live in one transactional engine. Every
//! mutation appends to the log and rewrites the affected record in the same
//! transaction, so the two never disagree.

use async_trait::async_trait;
use authdb_core::{Clock, KeyHash, NodeId, Record, ReplicationLogEntry, VersionedRecord};

use crate::error::{Result, StoreError};

/// Result of invalidating a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidateOutcome {
    /// The record was invalidated by this call.
    Invalidated(ReplicationLogEntry),
    /// The record was already invalidated (idempotent - not an error).
    AlreadyInvalidated,
}

/// Result of applying a replicated batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Entries merged and committed.
    pub applied: usize,
    /// The peer's watermark after the batch.
    pub watermark: Option<Clock>,
    /// The entry that stopped the batch, with its error. Nothing at or after
    /// it was committed.
    pub failed: Option<(ReplicationLogEntry, StoreError)>,
}

impl BatchOutcome {
    /// Whether every entry of the batch was applied.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

/// The Store trait: async interface for records and the replication log.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Clock**: each local write takes the next clock of this node, persisted
///   in the same transaction as the entry it versions.
/// - **Conflicts**: a transaction that loses a write-write race fails with
///   [`StoreError::Conflict`]. Callers retry with
///   [`retry_on_conflict`](crate::retry_on_conflict).
/// - **Merges**: replicated entries never create new local log entries; they
///   are copied into the local log as-is.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────────

    /// The node this store belongs to.
    fn node_id(&self) -> &NodeId;

    /// The last clock handed out to a local write.
    async fn current_clock(&self) -> Result<Clock>;

    // ─────────────────────────────────────────────────────────────────────────
    // Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a record and append its `Created` entry.
    ///
    /// Fails with `AlreadyExists` if a record exists for the key hash. The
    /// caller's `state` and invalidation fields are ignored.
    async fn put(&self, record: &Record) -> Result<ReplicationLogEntry>;

    /// Invalidate a record and append its `Invalidated` entry.
    ///
    /// Fails with `NotFound` if there is no record. Invalidating twice is not
    /// an error and appends nothing.
    async fn invalidate(
        &self,
        key_hash: &KeyHash,
        reason: &str,
        invalidated_at: i64,
    ) -> Result<InvalidateOutcome>;

    /// Get a record. Fails with `NotFound` if absent.
    async fn get(&self, key_hash: &KeyHash) -> Result<Record>;

    /// Get records with their versions. Absent keys are skipped.
    async fn get_versioned(&self, key_hashes: &[KeyHash]) -> Result<Vec<VersionedRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Replication Log
    // ─────────────────────────────────────────────────────────────────────────

    /// Entries authored by `node_id` with a clock strictly after `since`, in
    /// ascending clock order, at most `limit` of them.
    async fn scan_log_by_peer(
        &self,
        node_id: &NodeId,
        since: Clock,
        limit: usize,
    ) -> Result<Vec<ReplicationLogEntry>>;

    /// Every entry for `key_hash`, from every node.
    async fn find_log_by_key_hash(&self, key_hash: &KeyHash) -> Result<Vec<ReplicationLogEntry>>;

    /// Whether the local log holds `entry`.
    async fn has_log_entry(&self, entry: &ReplicationLogEntry) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Replication
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge a batch of entries authored by `peer`.
    ///
    /// `records` holds the peer's versions of the referenced records. Entries
    /// are merged in order; the first failure stops the batch, and the
    /// peer's watermark is advanced to the last merged clock in the same
    /// transaction.
    async fn apply_batch(
        &self,
        peer: &NodeId,
        entries: &[ReplicationLogEntry],
        records: &[VersionedRecord],
    ) -> Result<BatchOutcome>;

    /// The last applied clock of `peer`, if any.
    async fn watermark(&self, peer: &NodeId) -> Result<Option<Clock>>;

    /// Advance the watermark of `peer`. Never moves it backwards.
    async fn set_watermark(&self, peer: &NodeId, clock: Clock) -> Result<()>;
}
