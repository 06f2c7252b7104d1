//! Per-peer replication loop.
//!
//! A [`Replicator`] pulls the entries one peer authored since the local
//! watermark for that peer, fetches the records they reference, and merges
//! both through the store in a single transaction.
//!
//! ```text
//! Idle --tick--> Pulling --entries--> Merging --commit--> Idle
//!                   |                    |
//!                   +------ error -------+--> Idle (watermark unchanged)
//! ```
//!
//! Cancellation is observed while waiting for the timer, while waiting on
//! the network, and while the merge waits for the write lock or backs off
//! after a conflict. A cancelled cycle never leaves a half-applied batch:
//! the watermark and the merged entries only move together, in one
//! transaction.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use authdb_core::{Clock, KeyHash, NodeId, ReplicationLogEntry, VersionedRecord};
use authdb_store::{retry_on_conflict, RetryPolicy, Store};

use crate::error::{Result, SyncError};
use crate::messages::{limits, PeerErrorCode, PeerRequest, PeerResponse, PROTOCOL_VERSION};
use crate::transport::Transport;

/// Configuration for replication.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Max entries pulled per cycle.
    pub batch_size: usize,
    /// Timeout for one peer round trip.
    pub request_timeout: Duration,
    /// Backoff for merge transactions that hit a write conflict.
    pub retry: RetryPolicy,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// What a replicator is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Idle,
    Pulling,
    Merging,
    Stopped,
}

/// Observable progress of one replicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorStatus {
    pub peer: NodeId,
    pub state: ReplicatorState,
    /// Last applied clock of the peer.
    pub watermark: Option<Clock>,
    /// Error of the last cycle, cleared by a clean cycle.
    pub last_error: Option<String>,
    /// Cycles run, failed ones included. Cancelled cycles do not count.
    pub cycles: u64,
    pub failed_cycles: u64,
    /// Entries merged since start.
    pub applied: u64,
}

impl ReplicatorStatus {
    fn new(peer: NodeId) -> Self {
        Self {
            peer,
            state: ReplicatorState::Idle,
            watermark: None,
            last_error: None,
            cycles: 0,
            failed_cycles: 0,
            applied: 0,
        }
    }
}

/// Result of one replication cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries received from the peer.
    pub pulled: usize,
    /// Records received from the peer.
    pub fetched_records: usize,
    /// Entries merged.
    pub applied: usize,
    /// Watermark after the cycle.
    pub watermark: Option<Clock>,
    /// Why the batch stopped early, if it did. Entries before the failure
    /// are committed and the watermark covers them.
    pub failure: Option<String>,
}

/// Replicates one peer's log into the local store.
pub struct Replicator<S: Store, T: Transport> {
    store: Arc<S>,
    transport: Arc<T>,
    peer: NodeId,
    config: ReplicatorConfig,
    status: watch::Sender<ReplicatorStatus>,
}

impl<S: Store, T: Transport> Replicator<S, T> {
    pub fn new(store: Arc<S>, transport: Arc<T>, peer: NodeId, config: ReplicatorConfig) -> Self {
        let (status, _) = watch::channel(ReplicatorStatus::new(peer.clone()));
        Self {
            store,
            transport,
            peer,
            config,
            status,
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Watch this replicator's status.
    pub fn subscribe(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status.subscribe()
    }

    /// Run cycles on the configured interval until `cancel` fires.
    ///
    /// Failed cycles are logged and retried on the next tick from the same
    /// watermark.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(peer = %self.peer, interval = ?self.config.interval, "replicator started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle(&cancel).await {
                Ok(report) if report.applied > 0 => {
                    info!(
                        peer = %self.peer,
                        pulled = report.pulled,
                        applied = report.applied,
                        watermark = ?report.watermark,
                        "replication cycle complete"
                    );
                }
                Ok(_) => {}
                Err(SyncError::Cancelled) => break,
                Err(err) => {
                    warn!(peer = %self.peer, error = %err, "replication cycle failed");
                }
            }
        }

        self.status.send_modify(|s| s.state = ReplicatorState::Stopped);
        info!(peer = %self.peer, "replicator stopped");
    }

    /// Run one Idle -> Pulling -> Merging -> Idle pass.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let result = self.cycle(cancel).await;

        self.status.send_modify(|status| {
            status.state = ReplicatorState::Idle;
            if matches!(result, Err(SyncError::Cancelled)) {
                return;
            }
            status.cycles += 1;
            match &result {
                Ok(report) => {
                    status.applied += report.applied as u64;
                    status.watermark = report.watermark;
                    status.last_error = report.failure.clone();
                    if report.failure.is_some() {
                        status.failed_cycles += 1;
                    }
                }
                Err(err) => {
                    status.failed_cycles += 1;
                    status.last_error = Some(err.to_string());
                }
            }
        });

        result
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let watermark = self.store.watermark(&self.peer).await?;
        let since = watermark.unwrap_or(Clock::ZERO);
        let mut report = CycleReport {
            watermark,
            ..CycleReport::default()
        };

        self.set_state(ReplicatorState::Pulling);
        let entries = self.pull_log(since, cancel).await?;
        report.pulled = entries.len();
        if entries.is_empty() {
            return Ok(report);
        }

        // Entries already in the local log were merged when they arrived.
        let mut seen = HashSet::new();
        let mut wanted = Vec::new();
        for entry in &entries {
            if !self.store.has_log_entry(entry).await? && seen.insert(entry.key_hash) {
                wanted.push(entry.key_hash);
            }
        }
        let records = self.fetch_records(&wanted, cancel).await?;
        report.fetched_records = records.len();

        self.set_state(ReplicatorState::Merging);
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // An attempt already handed to the store commits or rolls back as a
        // whole; cancellation only stops further attempts.
        let merge = retry_on_conflict(&self.config.retry, || {
            self.store.apply_batch(&self.peer, &entries, &records)
        });
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            outcome = merge => outcome?,
        };

        report.applied = outcome.applied;
        report.watermark = outcome.watermark;
        if let Some((entry, err)) = outcome.failed {
            warn!(
                peer = %self.peer,
                clock = %entry.clock,
                key_hash = %entry.key_hash,
                error = %err,
                "merge stopped early"
            );
            report.failure = Some(format!("entry {}@{}: {}", entry.node_id, entry.clock, err));
        }

        debug!(
            peer = %self.peer,
            pulled = report.pulled,
            fetched = report.fetched_records,
            applied = report.applied,
            "merged batch"
        );
        Ok(report)
    }

    async fn pull_log(
        &self,
        since: Clock,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReplicationLogEntry>> {
        let limit = self.config.batch_size.clamp(1, limits::MAX_EXPORT_BATCH);
        let request = PeerRequest::ExportLog {
            protocol_version: PROTOCOL_VERSION,
            node_id: self.peer.clone(),
            since,
            limit: limit as u32,
        };

        match self.request(request, cancel).await? {
            PeerResponse::Log { entries } => {
                self.validate_entries(&entries, since, limit)?;
                Ok(entries)
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_records(
        &self,
        key_hashes: &[KeyHash],
        cancel: &CancellationToken,
    ) -> Result<Vec<VersionedRecord>> {
        let mut records = Vec::with_capacity(key_hashes.len());
        for chunk in key_hashes.chunks(limits::MAX_RECORDS_PER_FETCH) {
            let request = PeerRequest::FetchRecords {
                protocol_version: PROTOCOL_VERSION,
                key_hashes: chunk.to_vec(),
            };
            match self.request(request, cancel).await? {
                PeerResponse::Records { records: batch } => {
                    if let Some(stray) = batch.iter().find(|r| !chunk.contains(r.key_hash())) {
                        return Err(SyncError::InvalidMessage(format!(
                            "peer sent unrequested record {}",
                            stray.key_hash()
                        )));
                    }
                    records.extend(batch);
                }
                other => return Err(unexpected(&other)),
            }
        }
        Ok(records)
    }

    /// One round trip, bounded by the request timeout and `cancel`.
    async fn request(&self, request: PeerRequest, cancel: &CancellationToken) -> Result<PeerResponse> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = tokio::time::timeout(
                self.config.request_timeout,
                self.transport.request(&self.peer, request),
            ) => result.map_err(|_| {
                SyncError::Timeout(format!(
                    "no response from {} within {:?}",
                    self.peer, self.config.request_timeout
                ))
            })??,
        };

        response
            .validate_limits()
            .map_err(|reason| SyncError::InvalidMessage(reason.into()))?;
        match response {
            PeerResponse::Error {
                code: PeerErrorCode::VersionMismatch,
                message,
            } => Err(SyncError::VersionMismatch {
                local: PROTOCOL_VERSION,
                message,
            }),
            PeerResponse::Error { code, message } => Err(SyncError::PeerError { code, message }),
            response => Ok(response),
        }
    }

    /// Entries must be the peer's own, above the watermark, ascending, and
    /// no more than requested.
    fn validate_entries(&self, entries: &[ReplicationLogEntry], since: Clock, limit: usize) -> Result<()> {
        if entries.len() > limit {
            return Err(SyncError::InvalidMessage(format!(
                "{} entries exceed requested limit {}",
                entries.len(),
                limit
            )));
        }

        let mut previous = since;
        for entry in entries {
            if entry.node_id != self.peer {
                return Err(SyncError::InvalidMessage(format!(
                    "entry authored by {} in log of {}",
                    entry.node_id, self.peer
                )));
            }
            if entry.clock <= previous {
                return Err(SyncError::InvalidMessage(format!(
                    "entry clock {} not above {}",
                    entry.clock, previous
                )));
            }
            previous = entry.clock;
        }
        Ok(())
    }

    fn set_state(&self, state: ReplicatorState) {
        self.status.send_modify(|s| s.state = state);
    }
}

fn unexpected(response: &PeerResponse) -> SyncError {
    let kind = match response {
        PeerResponse::Log { .. } => "Log",
        PeerResponse::Records { .. } => "Records",
        PeerResponse::Error { .. } => "Error",
    };
    SyncError::InvalidMessage(format!("unexpected {} response", kind))
}
