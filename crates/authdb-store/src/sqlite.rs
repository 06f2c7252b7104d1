//! SQLite implementation of the Store trait.
//!
//! This is the storage backend for authdb. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! Every operation runs on its own connection to the database file, so the
//! store holds no lock of its own. Mutations run in `BEGIN IMMEDIATE`
//! transactions and race for the engine's write lock; the loser waits up to
//! the busy timeout and then fails with [`StoreError::Conflict`]. Reads run
//! on `query_only` connections against the WAL and never wait for a writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tempfile::TempDir;
use tracing::{debug, info};

use authdb_core::{
    codec, merge, Clock, KeyHash, NodeId, Record, RecordState, ReplicationLogEntry, Version,
    VersionedRecord,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{BatchOutcome, InvalidateOutcome, Store};

/// Configuration for a [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a transaction waits for another connection's write lock
    /// before failing with `Conflict`.
    pub busy_timeout: Duration,
    /// Use write-ahead logging for file databases.
    pub wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(100),
            wal: true,
        }
    }
}

/// SQLite-based store implementation.
///
/// Cheap to share behind an `Arc`: it only knows where the database lives.
/// All operations use spawn_blocking to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The node this database belongs to.
    node_id: NodeId,
    /// The database file.
    path: Arc<PathBuf>,
    busy_timeout: Duration,
    /// Owns the directory of a temporary database.
    _temp_dir: Option<TempDir>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path as `node_id`.
    ///
    /// Creates the file and runs migrations if it doesn't exist. Fails with
    /// `IdentityMismatch` if the database was created by another node.
    pub fn open(path: impl AsRef<Path>, node_id: NodeId, config: &StoreConfig) -> Result<Self> {
        Self::init(path.as_ref().to_path_buf(), node_id, config, None)
    }

    /// Open a SQLite database at the given path under the identity stored in
    /// it, or a fresh random identity for a new database.
    pub fn open_persisted(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let stored = {
            let mut conn = connect(path, config.busy_timeout)?;
            migration::migrate(&mut conn)?;
            load_identity(&conn)?.map(|(node_id, _)| node_id)
        };
        Self::open(path, stored.unwrap_or_else(NodeId::random), config)
    }

    /// Open a database in a fresh temporary directory that is removed when
    /// the store drops.
    ///
    /// Useful for testing.
    pub fn open_temporary(node_id: NodeId) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("authdb.sqlite");
        Self::init(path, node_id, &StoreConfig::default(), Some(dir))
    }

    fn init(
        path: PathBuf,
        node_id: NodeId,
        config: &StoreConfig,
        temp_dir: Option<TempDir>,
    ) -> Result<Self> {
        let mut conn = connect(&path, config.busy_timeout)?;
        if config.wal {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
        }
        migration::migrate(&mut conn)?;
        let clock = ensure_identity(&mut conn, &node_id)?;
        info!(node = %node_id, %clock, path = %path.display(), "opened record store");

        Ok(Self {
            node_id,
            path: Arc::new(path),
            busy_timeout: config.busy_timeout,
            _temp_dir: temp_dir,
        })
    }

    /// Run a blocking operation on a fresh read-write connection.
    async fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = Arc::clone(&self.path);
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path, busy_timeout)?;
            f(&mut conn)
        })
        .await?
    }

    /// Run a blocking operation on a fresh connection that refuses writes.
    async fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = Arc::clone(&self.path);
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path, busy_timeout)?;
            conn.pragma_update(None, "query_only", true)?;
            f(&mut conn)
        })
        .await?
    }
}

fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

#[async_trait]
impl Store for SqliteStore {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn current_clock(&self) -> Result<Clock> {
        self.read(|conn| {
            load_identity(conn)?
                .map(|(_, clock)| clock)
                .ok_or_else(|| StoreError::InvalidData("node identity missing".into()))
        })
        .await
    }

    async fn put(&self, record: &Record) -> Result<ReplicationLogEntry> {
        let mut record = record.clone();
        let node_id = self.node_id.clone();

        self.write(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if record_exists(&tx, &record.key_hash)? {
                return Err(StoreError::AlreadyExists(record.key_hash));
            }

            let clock = next_clock(&tx)?;
            let entry =
                ReplicationLogEntry::new(node_id, clock, record.key_hash, RecordState::Created);
            insert_entry(&tx, &entry)?;

            // A key with no record has no log history, so this entry alone
            // resolves its state.
            record.state = RecordState::Created;
            record.invalidation_reason = None;
            record.invalidated_at = None;
            write_record(&tx, &VersionedRecord::new(record, entry.version()))?;

            tx.commit()?;
            debug!(key_hash = %entry.key_hash, %clock, "put record");
            Ok(entry)
        })
        .await
    }

    async fn invalidate(
        &self,
        key_hash: &KeyHash,
        reason: &str,
        invalidated_at: i64,
    ) -> Result<InvalidateOutcome> {
        let key_hash = *key_hash;
        let reason = reason.to_string();
        let node_id = self.node_id.clone();

        self.write(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut versioned =
                load_record(&tx, &key_hash)?.ok_or(StoreError::NotFound(key_hash))?;
            if versioned.record.state == RecordState::Invalidated {
                return Ok(InvalidateOutcome::AlreadyInvalidated);
            }

            let clock = next_clock(&tx)?;
            let entry =
                ReplicationLogEntry::new(node_id, clock, key_hash, RecordState::Invalidated);
            insert_entry(&tx, &entry)?;

            versioned.record.state = RecordState::Invalidated;
            versioned.record.invalidation_reason = Some(reason);
            versioned.record.invalidated_at = Some(invalidated_at);
            versioned.invalidation_version = Some(entry.version());
            write_record(&tx, &versioned)?;

            tx.commit()?;
            debug!(%key_hash, %clock, "invalidated record");
            Ok(InvalidateOutcome::Invalidated(entry))
        })
        .await
    }

    async fn get(&self, key_hash: &KeyHash) -> Result<Record> {
        let key_hash = *key_hash;
        self.read(move |conn| {
            load_record(conn, &key_hash)?
                .map(|versioned| versioned.record)
                .ok_or(StoreError::NotFound(key_hash))
        })
        .await
    }

    async fn get_versioned(&self, key_hashes: &[KeyHash]) -> Result<Vec<VersionedRecord>> {
        let key_hashes = key_hashes.to_vec();
        self.read(move |conn| {
            let tx = conn.transaction()?;
            let mut records = Vec::with_capacity(key_hashes.len());
            for key_hash in &key_hashes {
                if let Some(versioned) = load_record(&tx, key_hash)? {
                    records.push(versioned);
                }
            }
            tx.commit()?;
            Ok(records)
        })
        .await
    }

    async fn scan_log_by_peer(
        &self,
        node_id: &NodeId,
        since: Clock,
        limit: usize,
    ) -> Result<Vec<ReplicationLogEntry>> {
        let Some((start, end)) = codec::node_range(node_id, since) else {
            return Ok(Vec::new());
        };
        let node_id = node_id.clone();

        self.read(move |conn| {
            let entries = scan_range(conn, &start, &end, Some(limit))?;
            if let Some(stray) = entries.iter().find(|e| e.node_id != node_id) {
                return Err(StoreError::InvalidData(format!(
                    "scan for node {} returned entry of node {}",
                    node_id, stray.node_id
                )));
            }
            Ok(entries)
        })
        .await
    }

    async fn find_log_by_key_hash(&self, key_hash: &KeyHash) -> Result<Vec<ReplicationLogEntry>> {
        let key_hash = *key_hash;
        self.read(move |conn| entries_for_key(conn, &key_hash))
            .await
    }

    async fn has_log_entry(&self, entry: &ReplicationLogEntry) -> Result<bool> {
        let key = entry.encode();
        self.read(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM replication_log WHERE entry = ?1)",
                params![key],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn apply_batch(
        &self,
        peer: &NodeId,
        entries: &[ReplicationLogEntry],
        records: &[VersionedRecord],
    ) -> Result<BatchOutcome> {
        let peer = peer.clone();
        let entries = entries.to_vec();
        let remote: HashMap<KeyHash, VersionedRecord> = records
            .iter()
            .map(|versioned| (*versioned.key_hash(), versioned.clone()))
            .collect();

        self.write(move |conn| {
            let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut outcome = BatchOutcome::default();
            let mut last_merged = None;

            for entry in entries {
                if entry.node_id != peer {
                    let err = StoreError::InvalidData(format!(
                        "entry authored by {} in batch from {}",
                        entry.node_id, peer
                    ));
                    outcome.failed = Some((entry, err));
                    break;
                }

                let sp = tx.savepoint()?;
                match merge_entry(&sp, &entry, remote.get(&entry.key_hash)) {
                    Ok(()) => {
                        sp.commit()?;
                        outcome.applied += 1;
                        last_merged = Some(entry.clock);
                    }
                    Err(err) => {
                        // Finishing an uncommitted savepoint rolls the entry back.
                        sp.finish()?;
                        outcome.failed = Some((entry, err));
                        break;
                    }
                }
            }

            if let Some(clock) = last_merged {
                advance_watermark(&tx, &peer, clock)?;
            }
            outcome.watermark = load_watermark(&tx, &peer)?;
            tx.commit()?;

            debug!(
                %peer,
                applied = outcome.applied,
                watermark = ?outcome.watermark,
                complete = outcome.is_complete(),
                "applied replication batch"
            );
            Ok(outcome)
        })
        .await
    }

    async fn watermark(&self, peer: &NodeId) -> Result<Option<Clock>> {
        let peer = peer.clone();
        self.read(move |conn| load_watermark(conn, &peer)).await
    }

    async fn set_watermark(&self, peer: &NodeId, clock: Clock) -> Result<()> {
        let peer = peer.clone();
        self.write(move |conn| advance_watermark(conn, &peer, clock))
            .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity and clock
// ─────────────────────────────────────────────────────────────────────────────

fn load_identity(conn: &Connection) -> Result<Option<(NodeId, Clock)>> {
    let row: Option<(Vec<u8>, Vec<u8>)> = conn
        .query_row(
            "SELECT node_id, clock FROM node_identity WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((node_id, clock)) => Ok(Some((
            NodeId::new(Bytes::from(node_id))?,
            Clock::from_bytes(&clock)?,
        ))),
        None => Ok(None),
    }
}

/// Bind the database to `node_id`, returning its durable clock.
fn ensure_identity(conn: &mut Connection, node_id: &NodeId) -> Result<Clock> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let clock = match load_identity(&tx)? {
        Some((stored, clock)) if stored == *node_id => clock,
        Some((stored, _)) => {
            return Err(StoreError::IdentityMismatch {
                stored,
                requested: node_id.clone(),
            })
        }
        None => {
            tx.execute(
                "INSERT INTO node_identity (id, node_id, clock, created_at) VALUES (1, ?1, ?2, ?3)",
                params![
                    node_id.as_bytes(),
                    &Clock::ZERO.to_bytes()[..],
                    crate::now_secs()
                ],
            )?;
            Clock::ZERO
        }
    };
    tx.commit()?;
    Ok(clock)
}

/// Take the next local clock. Persisted with the caller's transaction.
fn next_clock(conn: &Connection) -> Result<Clock> {
    let (_, current) = load_identity(conn)?
        .ok_or_else(|| StoreError::InvalidData("node identity missing".into()))?;
    let next = current.next()?;
    conn.execute(
        "UPDATE node_identity SET clock = ?1 WHERE id = 1",
        params![&next.to_bytes()[..]],
    )?;
    Ok(next)
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

fn record_exists(conn: &Connection, key_hash: &KeyHash) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM records WHERE key_hash = ?1)",
        params![&key_hash.as_bytes()[..]],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Raw column values of a `records` row.
struct RecordRow {
    key_hash: Vec<u8>,
    created_at: i64,
    public: bool,
    satellite_address: String,
    macaroon_head: Vec<u8>,
    encrypted_secret_key: Vec<u8>,
    encrypted_access_grant: Vec<u8>,
    expires_at: Option<i64>,
    invalidation_reason: Option<String>,
    invalidated_at: Option<i64>,
    state: u32,
    content_node: Vec<u8>,
    content_clock: Vec<u8>,
    invalidation_node: Option<Vec<u8>>,
    invalidation_clock: Option<Vec<u8>>,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key_hash: row.get("key_hash")?,
            created_at: row.get("created_at")?,
            public: row.get("public")?,
            satellite_address: row.get("satellite_address")?,
            macaroon_head: row.get("macaroon_head")?,
            encrypted_secret_key: row.get("encrypted_secret_key")?,
            encrypted_access_grant: row.get("encrypted_access_grant")?,
            expires_at: row.get("expires_at")?,
            invalidation_reason: row.get("invalidation_reason")?,
            invalidated_at: row.get("invalidated_at")?,
            state: row.get("state")?,
            content_node: row.get("content_node")?,
            content_clock: row.get("content_clock")?,
            invalidation_node: row.get("invalidation_node")?,
            invalidation_clock: row.get("invalidation_clock")?,
        })
    }

    fn into_versioned(self) -> Result<VersionedRecord> {
        let invalidation_version = match (self.invalidation_node, self.invalidation_clock) {
            (Some(node), Some(clock)) => Some(decode_version(node, &clock)?),
            (None, None) => None,
            _ => {
                return Err(StoreError::InvalidData(
                    "half-written invalidation version".into(),
                ))
            }
        };

        Ok(VersionedRecord {
            record: Record {
                key_hash: KeyHash::try_from(self.key_hash.as_slice())?,
                created_at: self.created_at,
                public: self.public,
                satellite_address: self.satellite_address,
                macaroon_head: Bytes::from(self.macaroon_head),
                encrypted_secret_key: Bytes::from(self.encrypted_secret_key),
                encrypted_access_grant: Bytes::from(self.encrypted_access_grant),
                expires_at: self.expires_at,
                invalidation_reason: self.invalidation_reason,
                invalidated_at: self.invalidated_at,
                state: RecordState::from_u32(self.state)?,
            },
            content_version: decode_version(self.content_node, &self.content_clock)?,
            invalidation_version,
        })
    }
}

fn decode_version(node: Vec<u8>, clock: &[u8]) -> Result<Version> {
    Ok(Version::new(
        NodeId::new(Bytes::from(node))?,
        Clock::from_bytes(clock)?,
    ))
}

fn load_record(conn: &Connection, key_hash: &KeyHash) -> Result<Option<VersionedRecord>> {
    let row = conn
        .query_row(
            "SELECT * FROM records WHERE key_hash = ?1",
            params![&key_hash.as_bytes()[..]],
            RecordRow::from_row,
        )
        .optional()?;
    row.map(RecordRow::into_versioned).transpose()
}

fn write_record(conn: &Connection, versioned: &VersionedRecord) -> Result<()> {
    let record = &versioned.record;
    let invalidation = versioned.invalidation_version.as_ref();

    conn.execute(
        "INSERT OR REPLACE INTO records (
            key_hash, created_at, public, satellite_address, macaroon_head,
            encrypted_secret_key, encrypted_access_grant, expires_at,
            invalidation_reason, invalidated_at, state,
            content_node, content_clock, invalidation_node, invalidation_clock
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            &record.key_hash.as_bytes()[..],
            record.created_at,
            record.public,
            record.satellite_address,
            &record.macaroon_head[..],
            &record.encrypted_secret_key[..],
            &record.encrypted_access_grant[..],
            record.expires_at,
            record.invalidation_reason,
            record.invalidated_at,
            record.state.to_u32(),
            versioned.content_version.node_id.as_bytes(),
            &versioned.content_version.clock.to_bytes()[..],
            invalidation.map(|v| v.node_id.as_bytes()),
            invalidation.map(|v| v.clock.to_bytes().to_vec()),
        ],
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Replication log
// ─────────────────────────────────────────────────────────────────────────────

/// Append an entry. Returns false if it was already present.
fn insert_entry(conn: &Connection, entry: &ReplicationLogEntry) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO replication_log (entry) VALUES (?1)",
        params![entry.encode()],
    )?;
    Ok(inserted > 0)
}

/// Decode every key in `[start, end)`, in key order.
///
/// The engine reuses its row buffers between steps; each key is copied out
/// before it is decoded.
fn scan_range(
    conn: &Connection,
    start: &[u8],
    end: &[u8],
    limit: Option<usize>,
) -> Result<Vec<ReplicationLogEntry>> {
    let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
    let mut stmt = conn.prepare_cached(
        "SELECT entry FROM replication_log
         WHERE entry >= ?1 AND entry < ?2
         ORDER BY entry
         LIMIT ?3",
    )?;

    let keys = stmt
        .query_map(params![start, end, limit], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    keys.iter()
        .map(|key| ReplicationLogEntry::decode(key).map_err(StoreError::from))
        .collect()
}

/// Every entry for `key_hash`: a key-only scan of the whole log.
fn entries_for_key(conn: &Connection, key_hash: &KeyHash) -> Result<Vec<ReplicationLogEntry>> {
    let (start, end) = codec::log_range();
    let mut entries = scan_range(conn, &start, &end, None)?;
    entries.retain(|entry| entry.key_hash == *key_hash);
    Ok(entries)
}

/// Copy a foreign entry into the local log and re-derive its record.
fn merge_entry(
    conn: &Connection,
    entry: &ReplicationLogEntry,
    remote: Option<&VersionedRecord>,
) -> Result<()> {
    let appended = insert_entry(conn, entry)?;
    let local = load_record(conn, &entry.key_hash)?;
    let history = entries_for_key(conn, &entry.key_hash)?;

    let merged = merge(local.as_ref(), remote, &history)
        .ok_or(StoreError::MissingRecord(entry.key_hash))?;

    if local.as_ref() != Some(&merged) {
        write_record(conn, &merged)?;
    }
    debug!(
        node = %entry.node_id,
        clock = %entry.clock,
        key_hash = %entry.key_hash,
        appended,
        state = %merged.record.state,
        "merged entry"
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Watermarks
// ─────────────────────────────────────────────────────────────────────────────

fn load_watermark(conn: &Connection, peer: &NodeId) -> Result<Option<Clock>> {
    let clock: Option<Vec<u8>> = conn
        .query_row(
            "SELECT clock FROM replication_watermarks WHERE peer = ?1",
            params![peer.as_bytes()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(clock.map(|c| Clock::from_bytes(&c)).transpose()?)
}

fn advance_watermark(conn: &Connection, peer: &NodeId, clock: Clock) -> Result<()> {
    // Clocks are stored big-endian, so BLOB comparison is numeric comparison.
    conn.execute(
        "INSERT INTO replication_watermarks (peer, clock, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(peer) DO UPDATE SET clock = excluded.clock, updated_at = excluded.updated_at
         WHERE excluded.clock > replication_watermarks.clock",
        params![peer.as_bytes(), &clock.to_bytes()[..], crate::now_secs()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn key(n: u8) -> KeyHash {
        KeyHash::from_bytes([n; 32])
    }

    fn make_record(n: u8, secret: &str) -> Record {
        Record::new(key(n), secret.as_bytes().to_vec(), b"grant".to_vec(), 1_700_000_000)
            .with_origin("us1.storj.io:7777", b"head".to_vec())
    }

    fn temp_store(n: &str) -> SqliteStore {
        SqliteStore::open_temporary(node(n)).unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get_record() {
        let store = temp_store("n1");
        let record = make_record(1, "sk").with_public(true).with_expiration(1_800_000_000);

        let entry = store.put(&record).await.unwrap();
        assert_eq!(entry.node_id, node("n1"));
        assert_eq!(entry.clock, Clock::new(1));
        assert_eq!(entry.state, RecordState::Created);

        let stored = store.get(&key(1)).await.unwrap();
        assert_eq!(stored, record);
        assert_eq!(store.current_clock().await.unwrap(), Clock::new(1));
    }

    #[tokio::test]
    async fn test_get_missing_record() {
        let store = temp_store("n1");
        assert!(matches!(store.get(&key(1)).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_put_and_repeated_invalidate() {
        let store = temp_store("n1");
        store.put(&make_record(1, "sk")).await.unwrap();

        let err = store.put(&make_record(1, "other")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(k) if k == key(1)));

        let first = store.invalidate(&key(1), "leaked", 100).await.unwrap();
        assert!(matches!(first, InvalidateOutcome::Invalidated(ref e) if e.clock == Clock::new(2)));
        let second = store.invalidate(&key(1), "leaked", 101).await.unwrap();
        assert_eq!(second, InvalidateOutcome::AlreadyInvalidated);

        let record = store.get(&key(1)).await.unwrap();
        assert_eq!(record.state, RecordState::Invalidated);
        assert_eq!(record.invalidation_reason.as_deref(), Some("leaked"));
        assert_eq!(record.invalidated_at, Some(100));
        assert_eq!(store.find_log_by_key_hash(&key(1)).await.unwrap().len(), 2);
        assert_eq!(store.current_clock().await.unwrap(), Clock::new(2));
    }

    #[tokio::test]
    async fn test_invalidate_missing_record() {
        let store = temp_store("n1");
        let err = store.invalidate(&key(1), "gone", 100).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.current_clock().await.unwrap(), Clock::ZERO);
    }

    #[tokio::test]
    async fn test_scan_log_by_peer_bounds() {
        let store = temp_store("node");
        for n in 1..=5 {
            store.put(&make_record(n, "sk")).await.unwrap();
        }

        let entries = store.scan_log_by_peer(&node("node"), Clock::new(2), 2).await.unwrap();
        let clocks: Vec<u64> = entries.iter().map(|e| e.clock.value()).collect();
        assert_eq!(clocks, vec![3, 4]);

        let all = store.scan_log_by_peer(&node("node"), Clock::ZERO, 100).await.unwrap();
        assert_eq!(all.len(), 5);

        assert!(store
            .scan_log_by_peer(&node("node"), Clock::new(5), 100)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .scan_log_by_peer(&node("node"), Clock::new(u64::MAX), 100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_scan_log_by_peer_ignores_other_nodes() {
        let store = temp_store("node");
        store.put(&make_record(1, "sk")).await.unwrap();

        for peer in ["node-a", "nodea"] {
            let entry = ReplicationLogEntry::new(node(peer), Clock::new(1), key(9), RecordState::Created);
            store
                .write(move |conn| insert_entry(conn, &entry).map(|_| ()))
                .await
                .unwrap();
        }

        let entries = store.scan_log_by_peer(&node("node"), Clock::ZERO, 100).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key_hash, key(1));
    }

    #[tokio::test]
    async fn test_corrupt_log_entry_fails_scan() {
        let store = temp_store("n1");
        store.put(&make_record(1, "sk")).await.unwrap();
        store
            .write(|conn| {
                conn.execute(
                    "INSERT INTO replication_log (entry) VALUES (?1)",
                    params![b"replication_log/n1/short".to_vec()],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.find_log_by_key_hash(&key(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }

    #[tokio::test]
    async fn test_apply_batch_merges_and_advances_watermark() {
        let n1 = temp_store("n1");
        let n2 = temp_store("n2");

        let e1 = n2.put(&make_record(1, "sk-n2")).await.unwrap();
        let e2 = n2.put(&make_record(2, "sk-n2")).await.unwrap();
        let records = n2.get_versioned(&[key(1), key(2)]).await.unwrap();

        let outcome = n1
            .apply_batch(&node("n2"), &[e1.clone(), e2.clone()], &records)
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.watermark, Some(Clock::new(2)));

        assert_eq!(n1.get(&key(1)).await.unwrap().encrypted_secret_key.as_ref(), b"sk-n2");
        assert!(n1.has_log_entry(&e1).await.unwrap());
        // Merges do not author entries.
        assert_eq!(n1.current_clock().await.unwrap(), Clock::ZERO);

        // Replaying is a no-op.
        let replay = n1.apply_batch(&node("n2"), &[e1, e2], &[]).await.unwrap();
        assert!(replay.is_complete());
        assert_eq!(replay.watermark, Some(Clock::new(2)));
        assert_eq!(n1.find_log_by_key_hash(&key(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_batch_stops_at_first_failure() {
        let n1 = temp_store("n1");
        let n2 = temp_store("n2");

        let e1 = n2.put(&make_record(1, "sk")).await.unwrap();
        let e2 = n2.put(&make_record(2, "sk")).await.unwrap();
        let e3 = n2.put(&make_record(3, "sk")).await.unwrap();
        // Withhold the record behind e2.
        let records = n2.get_versioned(&[key(1), key(3)]).await.unwrap();

        let outcome = n1
            .apply_batch(&node("n2"), &[e1.clone(), e2.clone(), e3.clone()], &records)
            .await
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.watermark, Some(Clock::new(1)));
        let (failed, err) = outcome.failed.unwrap();
        assert_eq!(failed, e2);
        assert!(matches!(err, StoreError::MissingRecord(k) if k == key(2)));

        assert!(n1.has_log_entry(&e1).await.unwrap());
        assert!(!n1.has_log_entry(&e2).await.unwrap());
        assert!(!n1.has_log_entry(&e3).await.unwrap());
        assert!(matches!(n1.get(&key(3)).await, Err(StoreError::NotFound(_))));
        assert_eq!(n1.watermark(&node("n2")).await.unwrap(), Some(Clock::new(1)));
    }

    #[tokio::test]
    async fn test_apply_batch_rejects_foreign_author() {
        let n1 = temp_store("n1");
        let n3 = temp_store("n3");
        let entry = n3.put(&make_record(1, "sk")).await.unwrap();
        let records = n3.get_versioned(&[key(1)]).await.unwrap();

        let outcome = n1.apply_batch(&node("n2"), &[entry], &records).await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert!(matches!(outcome.failed, Some((_, StoreError::InvalidData(_)))));
        assert_eq!(outcome.watermark, None);
    }

    #[tokio::test]
    async fn test_concurrent_creates_converge_on_smaller_node() {
        let n1 = temp_store("n1");
        let n2 = temp_store("n2");

        let e1 = n1.put(&make_record(1, "sk-n1")).await.unwrap();
        let e2 = n2.put(&make_record(1, "sk-n2")).await.unwrap();
        let r1 = n1.get_versioned(&[key(1)]).await.unwrap();
        let r2 = n2.get_versioned(&[key(1)]).await.unwrap();

        n1.apply_batch(&node("n2"), &[e2], &r2).await.unwrap();
        n2.apply_batch(&node("n1"), &[e1], &r1).await.unwrap();

        let a = n1.get_versioned(&[key(1)]).await.unwrap();
        let b = n2.get_versioned(&[key(1)]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].record.encrypted_secret_key.as_ref(), b"sk-n1");
        assert_eq!(a[0].record.state, RecordState::Created);
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let store = temp_store("n1");
        let peer = node("n2");
        assert_eq!(store.watermark(&peer).await.unwrap(), None);

        store.set_watermark(&peer, Clock::new(5)).await.unwrap();
        store.set_watermark(&peer, Clock::new(3)).await.unwrap();
        assert_eq!(store.watermark(&peer).await.unwrap(), Some(Clock::new(5)));

        store.set_watermark(&peer, Clock::new(256)).await.unwrap();
        assert_eq!(store.watermark(&peer).await.unwrap(), Some(Clock::new(256)));
    }

    #[tokio::test]
    async fn test_clock_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authdb.sqlite");
        let config = StoreConfig::default();

        {
            let store = SqliteStore::open(&path, node("n1"), &config).unwrap();
            for n in 1..=3 {
                store.put(&make_record(n, "sk")).await.unwrap();
            }
        }

        let store = SqliteStore::open(&path, node("n1"), &config).unwrap();
        assert_eq!(store.current_clock().await.unwrap(), Clock::new(3));
        let entry = store.put(&make_record(4, "sk")).await.unwrap();
        assert_eq!(entry.clock, Clock::new(4));
    }

    #[tokio::test]
    async fn test_identity_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authdb.sqlite");
        let config = StoreConfig::default();

        drop(SqliteStore::open(&path, node("n1"), &config).unwrap());
        let err = SqliteStore::open(&path, node("n2"), &config).err().unwrap();
        assert!(matches!(err, StoreError::IdentityMismatch { .. }));

        let persisted = SqliteStore::open_persisted(&path, &config).unwrap();
        assert_eq!(persisted.node_id(), &node("n1"));
    }

    #[tokio::test]
    async fn test_open_persisted_generates_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authdb.sqlite");
        let config = StoreConfig::default();

        let first = SqliteStore::open_persisted(&path, &config).unwrap().node_id().clone();
        let second = SqliteStore::open_persisted(&path, &config).unwrap().node_id().clone();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[tokio::test]
    async fn test_write_lock_contention_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authdb.sqlite");
        let config = StoreConfig {
            busy_timeout: Duration::from_millis(10),
            ..StoreConfig::default()
        };
        let store = SqliteStore::open(&path, node("n1"), &config).unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = store.put(&make_record(1, "sk")).await.unwrap_err();
        assert!(err.is_conflict(), "{err:?}");

        other.execute_batch("ROLLBACK").unwrap();
        store.put(&make_record(1, "sk")).await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_do_not_wait_for_blocked_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authdb.sqlite");
        let config = StoreConfig {
            busy_timeout: Duration::from_secs(2),
            ..StoreConfig::default()
        };
        let store = Arc::new(SqliteStore::open(&path, node("n1"), &config).unwrap());
        store.put(&make_record(1, "sk")).await.unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let writer = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.put(&make_record(2, "sk")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert_eq!(store.get(&key(1)).await.unwrap().key_hash, key(1));
        assert_eq!(store.scan_log_by_peer(&node("n1"), Clock::ZERO, 10).await.unwrap().len(), 1);
        assert_eq!(store.find_log_by_key_hash(&key(1)).await.unwrap().len(), 1);
        assert_eq!(store.watermark(&node("n2")).await.unwrap(), None);
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(500), "reads took {elapsed:?}");
        assert!(!writer.is_finished());

        other.execute_batch("ROLLBACK").unwrap();
        let entry = writer.await.unwrap().unwrap();
        assert_eq!(entry.clock, Clock::new(2));
    }

    fn arb_log() -> impl Strategy<Value = Vec<ReplicationLogEntry>> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["n1", "n2", "node", "node-a"]),
                0u64..1000,
                0u8..4,
                prop_oneof![Just(RecordState::Created), Just(RecordState::Invalidated)],
            )
                .prop_map(|(n, clock, k, state)| {
                    ReplicationLogEntry::new(node(n), Clock::new(clock), key(k), state)
                }),
            0..40,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn find_by_key_hash_matches_filter(log in arb_log(), target in 0u8..4) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let found = rt.block_on(async {
                let store = temp_store("local");
                let entries = log.clone();
                store
                    .write(move |conn| {
                        for entry in &entries {
                            insert_entry(conn, entry)?;
                        }
                        Ok(())
                    })
                    .await
                    .unwrap();
                store.find_log_by_key_hash(&key(target)).await.unwrap()
            });

            let mut expected: Vec<Vec<u8>> = log
                .iter()
                .filter(|e| e.key_hash == key(target))
                .map(|e| e.encode())
                .collect();
            expected.sort();
            expected.dedup();
            let found: Vec<Vec<u8>> = found.iter().map(|e| e.encode()).collect();
            prop_assert_eq!(found, expected);
        }
    }
}
