//! The contract between the peer engine and the services it hosts.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::bytes::Bytes;

use crate::codec::{Message, RoutingEnvelope};
use crate::error::Result;
use crate::framing::write_frame;
use crate::peer::{PeerId, ServiceAdvertisement};
use crate::session::SessionId;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write access to one live session, handed to the bound service.
///
/// Cloning is cheap; all clones share the stream and a write lock, so
/// frames from concurrent senders never interleave.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    remote_peer: PeerId,
    writer: Arc<Mutex<BoxedWriter>>,
    max_frame_len: usize,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(id: SessionId, remote_peer: PeerId, writer: BoxedWriter, max_frame_len: usize) -> Self {
        Self {
            id,
            remote_peer,
            writer: Arc::new(Mutex::new(writer)),
            max_frame_len,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// True once either side closed the session or the read loop ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Send `payload` to the remote service as SessionData.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write(&Message::SessionData {
            session_id: Some(self.id),
            payload: payload.into(),
        })
        .await
    }

    /// Send a routing envelope for the remote relay to forward.
    pub async fn send_routed(&self, envelope: RoutingEnvelope) -> Result<()> {
        self.write(&Message::RoutedSessionData {
            session_id: Some(self.id),
            envelope,
        })
        .await
    }

    /// Tell the remote side we are done and shut the write half down.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = Message::SessionClose {
            session_id: Some(self.id),
        }
        .encode();
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame, self.max_frame_len).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Shut the write half down without sending SessionClose.
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub(crate) async fn write(&self, message: &Message) -> Result<()> {
        let frame = message.encode();
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &frame, self.max_frame_len).await {
            self.mark_closed();
            return Err(e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A named service that can be bound to sessions.
///
/// For one session, callbacks are invoked sequentially from a single
/// reader task: `bind`, `session_started`, each `session_data` in wire
/// order, then `session_closed` exactly once.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Hand the service the write side of a newly established session.
    fn bind(&self, _session: SessionHandle) {}

    async fn session_started(&self, session_id: SessionId, remote_peer: PeerId);

    async fn session_data(&self, session_id: SessionId, payload: Bytes);

    async fn session_closed(&self, session_id: SessionId);
}

/// Maps a requested service name to the implementation that should serve it.
pub type ServiceResolver = Arc<dyn Fn(&str) -> Option<Arc<dyn Service>> + Send + Sync>;

struct HostedService {
    service: Arc<dyn Service>,
    metadata: String,
}

/// Services hosted by this node, keyed by name.
#[derive(Default)]
pub struct ServiceDirectory {
    services: DashMap<String, HostedService>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn Service>, metadata: impl Into<String>) {
        let name = service.name().to_string();
        tracing::info!("Hosting service {}", name);
        self.services.insert(
            name,
            HostedService {
                service,
                metadata: metadata.into(),
            },
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).map(|entry| entry.service.clone())
    }

    pub fn resolver(self: &Arc<Self>) -> ServiceResolver {
        let directory = self.clone();
        Arc::new(move |name: &str| directory.resolve(name))
    }

    /// Advertisements for the discovery Announce; every service shares the session listener.
    pub fn advertisements(&self, address: &str, port: u16) -> Vec<ServiceAdvertisement> {
        let mut ads: Vec<_> = self
            .services
            .iter()
            .map(|entry| ServiceAdvertisement {
                name: entry.key().clone(),
                address: address.to_string(),
                port,
                metadata: entry.metadata.clone(),
            })
            .collect();
        ads.sort_by(|a, b| a.name.cmp(&b.name));
        ads
    }
}

/// Writes every payload back on the session it arrived on.
pub struct EchoService {
    name: String,
    sessions: DashMap<SessionId, SessionHandle>,
}

impl EchoService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sessions: DashMap::new(),
        }
    }
}

#[async_trait]
impl Service for EchoService {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, session: SessionHandle) {
        self.sessions.insert(session.id(), session);
    }

    async fn session_started(&self, session_id: SessionId, remote_peer: PeerId) {
        tracing::debug!("{} session {} started with {}", self.name, session_id, remote_peer);
    }

    async fn session_data(&self, session_id: SessionId, payload: Bytes) {
        let handle = self.sessions.get(&session_id).map(|h| h.clone());
        if let Some(handle) = handle {
            if let Err(e) = handle.send(payload).await {
                tracing::warn!("Echo on session {} failed: {}", session_id, e);
            }
        }
    }

    async fn session_closed(&self, session_id: SessionId) {
        self.sessions.remove(&session_id);
    }
}

/// Session lifecycle as delivered by a [`ChannelService`].
#[derive(Debug)]
pub enum SessionEvent {
    Started {
        session: SessionHandle,
        remote_peer: PeerId,
    },
    Data {
        session_id: SessionId,
        payload: Bytes,
    },
    Closed {
        session_id: SessionId,
    },
}

/// Forwards session events into a bounded channel owned by the caller.
///
/// A full channel suspends the session's reader, so a slow consumer
/// pushes back on the remote peer instead of buffering without limit.
pub struct ChannelService {
    name: String,
    events: mpsc::Sender<SessionEvent>,
    bound: DashMap<SessionId, SessionHandle>,
}

impl ChannelService {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(capacity);
        let service = Arc::new(Self {
            name: name.into(),
            events,
            bound: DashMap::new(),
        });
        (service, rx)
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("{} event receiver dropped", self.name);
        }
    }
}

#[async_trait]
impl Service for ChannelService {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, session: SessionHandle) {
        self.bound.insert(session.id(), session);
    }

    async fn session_started(&self, session_id: SessionId, remote_peer: PeerId) {
        let session = self.bound.remove(&session_id).map(|(_, handle)| handle);
        if let Some(session) = session {
            self.emit(SessionEvent::Started {
                session,
                remote_peer,
            })
            .await;
        }
    }

    async fn session_data(&self, session_id: SessionId, payload: Bytes) {
        self.emit(SessionEvent::Data {
            session_id,
            payload,
        })
        .await;
    }

    async fn session_closed(&self, session_id: SessionId) {
        self.bound.remove(&session_id);
        self.emit(SessionEvent::Closed { session_id }).await;
    }
}
