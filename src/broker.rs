//! Chooses direct or relayed delivery for outgoing payloads.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::RoutingEnvelope;
use crate::connectivity::{ConnectivityMode, ConnectivityMonitor};
use crate::engine::PeerEngine;
use crate::error::{Result, ZerolinkError};
use crate::links::SessionCache;
use crate::peer::PeerId;
use crate::relay::{RelaySink, RELAY_SERVICE};
use crate::service::{Service, SessionHandle};
use crate::session::SessionId;

/// How a payload left this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct { session_id: SessionId },
    Routed { route_id: Uuid, relay_session: SessionId },
}

pub struct SessionBroker {
    engine: Arc<PeerEngine>,
    monitor: Arc<ConnectivityMonitor>,
    relay_session: Mutex<Option<SessionHandle>>,
    direct: SessionCache<(SocketAddr, String)>,
}

impl SessionBroker {
    pub fn new(engine: Arc<PeerEngine>, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            engine,
            monitor,
            relay_session: Mutex::new(None),
            direct: SessionCache::new(),
        }
    }

    /// Send `payload` for `service` to `target_peer`, direct or through the relay
    /// depending on the current connectivity mode.
    ///
    /// In Direct mode an open session `session_id` is reused when given;
    /// otherwise the cached session for the address and service is used, or
    /// a new one is opened with `service` bound to it.
    pub async fn send(
        &self,
        target_peer: PeerId,
        address: IpAddr,
        port: u16,
        service: Arc<dyn Service>,
        payload: Bytes,
        session_id: Option<SessionId>,
    ) -> Result<Delivery> {
        match self.monitor.mode() {
            ConnectivityMode::Routed => self.send_routed(target_peer, service.name(), payload).await,
            ConnectivityMode::Direct => {
                self.send_direct(target_peer, SocketAddr::new(address, port), service, payload, session_id)
                    .await
            }
        }
    }

    async fn send_routed(&self, target_peer: PeerId, service: &str, payload: Bytes) -> Result<Delivery> {
        let relay = self.relay_handle().await?;
        let envelope = RoutingEnvelope {
            route_id: Uuid::new_v4(),
            source: self.engine.local_id(),
            destination: target_peer,
            service: service.to_string(),
            payload,
        };
        let route_id = envelope.route_id;

        if let Err(e) = relay.send_routed(envelope).await {
            self.relay_session.lock().await.take();
            return Err(e);
        }
        Ok(Delivery::Routed {
            route_id,
            relay_session: relay.id(),
        })
    }

    /// The open coordinator session, opening one if needed.
    async fn relay_handle(&self) -> Result<SessionHandle> {
        let mut slot = self.relay_session.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let relay = self.monitor.relay().ok_or(ZerolinkError::NoRelay)?;
        // The coordinator answers for itself whatever destination we name
        let handle = self
            .engine
            .connect_as(relay, PeerId(Uuid::nil()), RELAY_SERVICE, Arc::new(RelaySink))
            .await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    async fn send_direct(
        &self,
        target_peer: PeerId,
        addr: SocketAddr,
        service: Arc<dyn Service>,
        payload: Bytes,
        session_id: Option<SessionId>,
    ) -> Result<Delivery> {
        let key = (addr, service.name().to_string());

        let reused = session_id
            .and_then(|id| self.direct.find(id))
            .filter(|(_, handle)| !handle.is_closed());
        let (used, handle) = match reused {
            Some(found) => found,
            None => {
                let handle = self
                    .direct
                    .get_or_open(key.clone(), move || {
                        self.engine.connect(addr, target_peer, service)
                    })
                    .await?;
                (key, handle)
            }
        };

        if let Err(e) = handle.send(payload).await {
            self.direct.evict(&used, handle.id());
            return Err(e);
        }
        Ok(Delivery::Direct {
            session_id: handle.id(),
        })
    }

    /// Drop the coordinator session when the monitor falls back to Direct.
    pub async fn follow_mode(&self, cancel: CancellationToken) {
        let mut transitions = self.monitor.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = transitions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let mode = *transitions.borrow_and_update();
            if mode == ConnectivityMode::Direct {
                let relay = self.relay_session.lock().await.take();
                if let Some(relay) = relay {
                    tracing::info!("Closing relay session {}", relay.id());
                    if let Err(e) = relay.close().await {
                        tracing::debug!("Relay session close failed: {}", e);
                    }
                }
            }
        }
    }

    /// Close every cached session.
    pub async fn close_all(&self) {
        for handle in self.direct.drain() {
            let _ = handle.close().await;
        }
        if let Some(relay) = self.relay_session.lock().await.take() {
            let _ = relay.close().await;
        }
    }
}
