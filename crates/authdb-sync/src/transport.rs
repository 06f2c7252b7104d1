//! Transport abstraction for the peer protocol.
//!
//! The transport layer handles message serialization and delivery.
//! Implementations may use HTTP, gRPC, or any other request/response
//! channel; authentication of peers is the transport's concern.

use async_trait::async_trait;

use authdb_core::NodeId;

use crate::error::Result;
use crate::messages::{PeerRequest, PeerResponse};

/// Transport trait for sending requests to peers.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request to `peer` and wait for its response.
    ///
    /// Fails with `PeerUnreachable` if the peer cannot be contacted.
    async fn request(&self, peer: &NodeId, request: PeerRequest) -> Result<PeerResponse>;
}

/// Server side of the peer protocol.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Answer one request. Failures are reported as `PeerResponse::Error`.
    async fn handle(&self, request: PeerRequest) -> PeerResponse;
}

/// A simple in-memory transport for testing.
///
/// Requests are CBOR-encoded, routed to the handler registered for the
/// target node, and the response is encoded back, so the wire format is
/// exercised end to end.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    use crate::error::SyncError;

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        /// Request handlers for each node.
        handlers: RwLock<HashMap<NodeId, Arc<dyn RequestHandler>>>,
        /// Nodes cut off from the network.
        partitioned: RwLock<HashSet<NodeId>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Serve requests addressed to `node_id` with `handler`.
        pub async fn register(&self, node_id: NodeId, handler: Arc<dyn RequestHandler>) {
            self.handlers.write().await.insert(node_id, handler);
        }

        /// Cut `node_id` off: it can neither send nor receive requests.
        pub async fn partition(&self, node_id: &NodeId) {
            self.partitioned.write().await.insert(node_id.clone());
        }

        /// Reconnect a partitioned node.
        pub async fn heal(&self, node_id: &NodeId) {
            self.partitioned.write().await.remove(node_id);
        }

        /// Create a transport sending requests as `node_id`.
        pub fn transport(self: &Arc<Self>, node_id: NodeId) -> MemoryTransport {
            MemoryTransport {
                node_id,
                network: Arc::clone(self),
            }
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        node_id: NodeId,
        network: Arc<MemoryNetwork>,
    }

    impl MemoryTransport {
        /// The node this transport sends as.
        pub fn local_node_id(&self) -> &NodeId {
            &self.node_id
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn request(&self, peer: &NodeId, request: PeerRequest) -> Result<PeerResponse> {
            {
                let partitioned = self.network.partitioned.read().await;
                if partitioned.contains(&self.node_id) || partitioned.contains(peer) {
                    return Err(SyncError::PeerUnreachable(peer.clone()));
                }
            }

            let handler = self
                .network
                .handlers
                .read()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| SyncError::PeerUnreachable(peer.clone()))?;

            let wire = request.to_bytes()?;
            let response = handler.handle(PeerRequest::from_bytes(&wire)?).await;
            PeerResponse::from_bytes(&response.to_bytes()?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use crate::error::SyncError;
    use crate::messages::{PeerErrorCode, PROTOCOL_VERSION};
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: PeerRequest) -> PeerResponse {
            PeerResponse::error(PeerErrorCode::Unknown, format!("{:?}", request))
        }
    }

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn fetch() -> PeerRequest {
        PeerRequest::FetchRecords {
            protocol_version: PROTOCOL_VERSION,
            key_hashes: vec![],
        }
    }

    #[tokio::test]
    async fn test_memory_transport_routes_to_handler() {
        let network = MemoryNetwork::new();
        network.register(node("b"), Arc::new(Echo)).await;

        let transport = network.transport(node("a"));
        let response = transport.request(&node("b"), fetch()).await.unwrap();
        assert!(matches!(response, PeerResponse::Error { message, .. } if message.contains("FetchRecords")));
    }

    #[tokio::test]
    async fn test_memory_transport_unknown_peer() {
        let network = MemoryNetwork::new();
        let transport = network.transport(node("a"));
        let err = transport.request(&node("b"), fetch()).await.unwrap_err();
        assert!(matches!(err, SyncError::PeerUnreachable(peer) if peer == node("b")));
    }

    #[tokio::test]
    async fn test_memory_transport_partition() {
        let network = MemoryNetwork::new();
        network.register(node("b"), Arc::new(Echo)).await;
        let transport = network.transport(node("a"));

        network.partition(&node("b")).await;
        assert!(transport.request(&node("b"), fetch()).await.is_err());

        network.heal(&node("b")).await;
        network.partition(&node("a")).await;
        assert!(transport.request(&node("b"), fetch()).await.is_err());

        network.heal(&node("a")).await;
        assert!(transport.request(&node("b"), fetch()).await.is_ok());
    }
}
