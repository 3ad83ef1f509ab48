//! Coordinator role: forward routed payloads one hop to their destination.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::bytes::Bytes;

use crate::codec::RoutingEnvelope;
use crate::directory::PeerDirectory;
use crate::engine::PeerEngine;
use crate::error::{Result, ZerolinkError};
use crate::links::SessionCache;
use crate::peer::PeerId;
use crate::service::Service;
use crate::session::SessionId;

/// Service name peers request when opening a session to the coordinator.
pub const RELAY_SERVICE: &str = "relay";

/// Bound to relay legs on both ends. Payloads arriving here are not
/// addressed to any local service and are dropped uninspected.
pub struct RelaySink;

#[async_trait]
impl Service for RelaySink {
    fn name(&self) -> &str {
        RELAY_SERVICE
    }

    async fn session_started(&self, session_id: SessionId, remote_peer: PeerId) {
        tracing::debug!("Relay session {} open with {}", session_id, remote_peer);
    }

    async fn session_data(&self, session_id: SessionId, payload: Bytes) {
        tracing::debug!(
            "Dropping {} unrouted bytes on relay session {}",
            payload.len(),
            session_id
        );
    }

    async fn session_closed(&self, session_id: SessionId) {
        tracing::debug!("Relay session {} closed", session_id);
    }
}

/// Outbound legs held by a coordinator, one per destination peer and service.
pub struct Relay {
    directory: Arc<PeerDirectory>,
    links: SessionCache<(PeerId, String)>,
    sink: Arc<RelaySink>,
}

impl Relay {
    pub fn new(directory: Arc<PeerDirectory>) -> Self {
        Self {
            directory,
            links: SessionCache::new(),
            sink: Arc::new(RelaySink),
        }
    }

    pub fn sink(&self) -> Arc<dyn Service> {
        self.sink.clone()
    }

    /// Deliver the envelope's payload as SessionData to its destination.
    ///
    /// Boxed because forwarding may open a session whose reader can itself forward.
    pub fn forward<'a>(
        &'a self,
        engine: &'a Arc<PeerEngine>,
        envelope: RoutingEnvelope,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.forward_inner(engine, envelope))
    }

    async fn forward_inner(&self, engine: &Arc<PeerEngine>, envelope: RoutingEnvelope) -> Result<()> {
        let key = (envelope.destination, envelope.service.clone());
        let (destination, service) = (envelope.destination, envelope.service.as_str());
        let link = self
            .links
            .get_or_open(key.clone(), move || async move {
                let addr = self
                    .directory
                    .resolve_service(&destination, service)
                    .ok_or_else(|| ZerolinkError::Unresolved {
                        peer: destination,
                        service: service.to_string(),
                    })?;
                tracing::info!(
                    "Opening relay leg to {} for {} at {}",
                    destination,
                    service,
                    addr
                );
                engine
                    .connect_as(addr, destination, service, self.sink())
                    .await
            })
            .await?;

        tracing::debug!(
            "Relaying route {} from {} to {} ({} bytes)",
            envelope.route_id,
            envelope.source,
            envelope.destination,
            envelope.payload.len()
        );
        if let Err(e) = link.send(envelope.payload).await {
            self.links.evict(&key, link.id());
            return Err(e);
        }
        Ok(())
    }

    pub fn link_count(&self) -> usize {
        self.links.open_count()
    }
}
