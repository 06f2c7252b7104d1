//! Serving the local log to peers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use authdb_store::Store;

use crate::messages::{limits, PeerErrorCode, PeerRequest, PeerResponse, PROTOCOL_VERSION};
use crate::transport::RequestHandler;

/// Answers peer requests from a local [`Store`].
///
/// `ExportLog` is served from the log, so a node exports the entries it
/// authored as well as any it copied from other nodes.
pub struct LogExporter<S: Store> {
    store: Arc<S>,
}

impl<S: Store> LogExporter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Store> Clone for LogExporter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

#[async_trait]
impl<S: Store + 'static> RequestHandler for LogExporter<S> {
    async fn handle(&self, request: PeerRequest) -> PeerResponse {
        if request.protocol_version() != PROTOCOL_VERSION {
            return PeerResponse::error(
                PeerErrorCode::VersionMismatch,
                format!(
                    "protocol version {} not supported, expected {}",
                    request.protocol_version(),
                    PROTOCOL_VERSION
                ),
            );
        }
        if let Err(reason) = request.validate_limits() {
            return PeerResponse::error(PeerErrorCode::MessageTooLarge, reason);
        }

        match request {
            PeerRequest::ExportLog {
                node_id,
                since,
                limit,
                ..
            } => {
                let limit = (limit as usize).min(limits::MAX_EXPORT_BATCH);
                match self.store.scan_log_by_peer(&node_id, since, limit).await {
                    Ok(entries) => {
                        debug!(node = %node_id, %since, count = entries.len(), "exported log entries");
                        PeerResponse::Log { entries }
                    }
                    Err(err) => {
                        warn!(node = %node_id, %since, error = %err, "log export failed");
                        PeerResponse::error(PeerErrorCode::InternalError, err.to_string())
                    }
                }
            }
            PeerRequest::FetchRecords { key_hashes, .. } => {
                match self.store.get_versioned(&key_hashes).await {
                    Ok(records) => PeerResponse::Records { records },
                    Err(err) => {
                        warn!(error = %err, "record fetch failed");
                        PeerResponse::error(PeerErrorCode::InternalError, err.to_string())
                    }
                }
            }
        }
    }
}
