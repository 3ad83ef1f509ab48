//! ZCSP peer engine: service handshake, session loops, accept loop.
//!
//! Handshake (client → server): `ServiceRequest{request id, source,
//! destination, service}`; server → client: `ServiceResponse` carrying the
//! new session id and its expiry. A server that does not host the service,
//! or receives anything malformed, closes the connection without replying.

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{Message, ServiceRequest};
use crate::config::SessionConfig;
use crate::directory::PeerDirectory;
use crate::error::{Result, ZerolinkError};
use crate::framing::{read_frame, write_frame, FrameCodec};
use crate::peer::PeerId;
use crate::relay::{Relay, RELAY_SERVICE};
use crate::service::{Service, ServiceResolver, SessionHandle};
use crate::session::SessionRegistry;

pub struct PeerEngine {
    local_id: PeerId,
    config: SessionConfig,
    registry: Arc<SessionRegistry>,
    outbound: Arc<SessionRegistry>,
    resolver: ServiceResolver,
    relay: Option<Relay>,
    connection_slots: Arc<Semaphore>,
}

impl PeerEngine {
    pub fn new(
        local_id: PeerId,
        config: SessionConfig,
        registry: Arc<SessionRegistry>,
        resolver: ServiceResolver,
    ) -> Self {
        let connection_slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            local_id,
            config,
            registry,
            outbound: Arc::new(SessionRegistry::new()),
            resolver,
            relay: None,
            connection_slots,
        }
    }

    /// Act as coordinator: forward RoutedSessionData using `directory` to find destinations.
    pub fn with_relay(mut self, directory: Arc<PeerDirectory>) -> Self {
        self.relay = Some(Relay::new(directory));
        self
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Sessions accepted by this engine's listener.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Sessions this engine opened to other listeners, its own included.
    pub fn outbound_registry(&self) -> &Arc<SessionRegistry> {
        &self.outbound
    }

    pub fn is_coordinator(&self) -> bool {
        self.relay.is_some()
    }

    pub fn relay(&self) -> Option<&Relay> {
        self.relay.as_ref()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind).await?;
        tracing::info!("Session listener on {}", listener.local_addr()?);
        Ok(listener)
    }

    fn resolve(&self, name: &str) -> Option<Arc<dyn Service>> {
        if let Some(relay) = &self.relay {
            if name == RELAY_SERVICE {
                return Some(relay.sink());
            }
        }
        (self.resolver)(name)
    }

    /// Accept connections until cancelled, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.connection_slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.handle_inbound(stream, addr).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                }
            }
        }
        tracing::info!("Session listener stopped");
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let handshake = timeout(self.config.handshake_timeout(), self.read_request(&mut stream));
        let (request, service) = match handshake.await {
            Ok(Ok(Some(accepted))) => accepted,
            Ok(Ok(None)) => {
                tracing::debug!("Rejected connection from {}", addr);
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!("Handshake with {} failed: {}", addr, e);
                return;
            }
            Err(_) => {
                tracing::debug!("Handshake with {} timed out", addr);
                return;
            }
        };

        let session = self
            .registry
            .create(request.source, self.config.lifetime());
        let (reader, writer) = stream.into_split();
        let handle = SessionHandle::new(
            session.id,
            request.source,
            Box::new(writer),
            self.config.max_frame_len,
        );

        let response = Message::ServiceResponse {
            session_id: session.id,
            expires_at: session.expires_at_unix_millis(),
        };
        if let Err(e) = handle.write(&response).await {
            tracing::debug!("Failed to answer {}: {}", addr, e);
            self.registry.remove(&session.id);
            return;
        }

        tracing::info!(
            "Session {} for {} opened by {} ({})",
            session.id,
            request.service,
            request.source,
            addr
        );
        service.bind(handle.clone());
        service.session_started(session.id, request.source).await;
        let registry = self.registry.clone();
        self.run_session(registry, reader, handle, service).await;
    }

    /// Read the opening frame. `Ok(None)` means the request was well-formed but not served here.
    async fn read_request(
        &self,
        stream: &mut TcpStream,
    ) -> Result<Option<(ServiceRequest, Arc<dyn Service>)>> {
        let frame = read_frame(stream, self.config.max_frame_len)
            .await?
            .ok_or_else(|| ZerolinkError::HandshakeClosed {
                addr: peer_addr(stream),
            })?;

        let request = match Message::decode(frame)? {
            Message::ServiceRequest(request) => request,
            other => {
                return Err(ZerolinkError::UnexpectedMessage {
                    wanted: "ServiceRequest",
                    got: other.kind().name(),
                })
            }
        };

        match self.resolve(&request.service) {
            Some(service) => Ok(Some((request, service))),
            None => {
                tracing::debug!(
                    "{} asked for unknown service {}",
                    request.source,
                    request.service
                );
                Ok(None)
            }
        }
    }

    /// Open a session to `service.name()` on the peer at `addr`.
    ///
    /// Returns once the handshake completes; the session's reader runs on
    /// its own task and delivers data to `service`.
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        target_peer: PeerId,
        service: Arc<dyn Service>,
    ) -> Result<SessionHandle> {
        let name = service.name().to_string();
        self.connect_as(addr, target_peer, &name, service).await
    }

    /// Like [`connect`](Self::connect) but requests `service_name` while binding `local` to the session.
    pub async fn connect_as(
        self: &Arc<Self>,
        addr: SocketAddr,
        target_peer: PeerId,
        service_name: &str,
        local: Arc<dyn Service>,
    ) -> Result<SessionHandle> {
        let limit = self.config.handshake_timeout();
        let (stream, session_id, expires_at) =
            match timeout(limit, self.handshake(addr, target_peer, service_name)).await {
                Ok(result) => result?,
                Err(_) => return Err(ZerolinkError::Timeout(format!("handshake with {}", addr))),
            };

        // expires_at is on the server's clock, so the local entry uses our own lifetime
        tracing::debug!("Session {} expires at {} on the server", session_id, expires_at);
        let session = self
            .outbound
            .adopt(session_id, target_peer, self.config.lifetime())?;

        let (reader, writer) = stream.into_split();
        let handle = SessionHandle::new(
            session.id,
            target_peer,
            Box::new(writer),
            self.config.max_frame_len,
        );

        tracing::info!(
            "Session {} for {} established with {} ({})",
            session.id,
            service_name,
            target_peer,
            addr
        );
        local.bind(handle.clone());
        local.session_started(session.id, target_peer).await;

        let engine = self.clone();
        let registry = self.outbound.clone();
        let loop_handle = handle.clone();
        tokio::spawn(async move {
            engine
                .run_session(registry, reader, loop_handle, local)
                .await
        });

        Ok(handle)
    }

    async fn handshake(
        &self,
        addr: SocketAddr,
        target_peer: PeerId,
        service_name: &str,
    ) -> Result<(TcpStream, crate::session::SessionId, i64)> {
        let mut stream = TcpStream::connect(addr).await?;
        let request = Message::ServiceRequest(ServiceRequest {
            request_id: Uuid::new_v4(),
            source: self.local_id,
            destination: target_peer,
            service: service_name.to_string(),
        });
        write_frame(&mut stream, &request.encode(), self.config.max_frame_len).await?;

        let frame = read_frame(&mut stream, self.config.max_frame_len)
            .await?
            .ok_or_else(|| ZerolinkError::HandshakeClosed {
                addr: addr.to_string(),
            })?;

        match Message::decode(frame)? {
            Message::ServiceResponse {
                session_id,
                expires_at,
            } => Ok((stream, session_id, expires_at)),
            other => Err(ZerolinkError::UnexpectedMessage {
                wanted: "ServiceResponse",
                got: other.kind().name(),
            }),
        }
    }

    /// Read frames in order until the stream closes or the peer sends SessionClose.
    async fn run_session(
        self: Arc<Self>,
        registry: Arc<SessionRegistry>,
        reader: OwnedReadHalf,
        handle: SessionHandle,
        service: Arc<dyn Service>,
    ) {
        let session_id = handle.id();
        let mut frames = FramedRead::new(reader, FrameCodec::new(self.config.max_frame_len));

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("Session {} read failed: {}", session_id, e);
                    break;
                }
            };

            let message = match Message::decode(frame.freeze()) {
                Ok(message) => message,
                Err(ZerolinkError::UnknownMessageType(tag)) => {
                    tracing::debug!("Session {} ignoring message type {}", session_id, tag);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Session {} sent malformed message: {}", session_id, e);
                    break;
                }
            };

            match message {
                Message::SessionClose { .. } => break,
                Message::SessionData { payload, .. } => {
                    if !registry.extend(&session_id, self.config.lifetime()) {
                        tracing::info!("Session {} expired", session_id);
                        break;
                    }
                    service.session_data(session_id, payload).await;
                }
                Message::RoutedSessionData { envelope, .. } => match &self.relay {
                    Some(relay) => {
                        if let Err(e) = relay.forward(&self, envelope).await {
                            tracing::warn!("Relay from session {} failed: {}", session_id, e);
                        }
                    }
                    None => tracing::debug!("Session {} ignoring routed data", session_id),
                },
                other => {
                    tracing::debug!(
                        "Session {} ignoring {}",
                        session_id,
                        other.kind().name()
                    );
                }
            }
        }

        handle.mark_closed();
        handle.shutdown().await;
        registry.remove(&session_id);
        service.session_closed(session_id).await;
        tracing::info!("Session {} closed", session_id);
    }
}

fn peer_addr(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::unix_millis;
    use crate::service::{ChannelService, ServiceDirectory, SessionEvent};
    use crate::session::SessionId;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::bytes::Bytes;

    async fn hosting(
        lifetime_secs: u64,
    ) -> (Arc<PeerEngine>, SocketAddr, mpsc::Receiver<SessionEvent>, CancellationToken) {
        let (chat, events) = ChannelService::new("Chat", 16);
        let services = Arc::new(ServiceDirectory::new());
        services.register(chat, "");
        let config = SessionConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            lifetime_secs,
            ..SessionConfig::default()
        };
        let engine = Arc::new(PeerEngine::new(
            PeerId::new_random(),
            config,
            Arc::new(SessionRegistry::new()),
            services.resolver(),
        ));
        let listener = engine.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(engine.clone().serve(listener, cancel.clone()));
        (engine, addr, events, cancel)
    }

    fn client_engine() -> Arc<PeerEngine> {
        Arc::new(PeerEngine::new(
            PeerId::new_random(),
            SessionConfig::default(),
            Arc::new(SessionRegistry::new()),
            Arc::new(|_: &str| -> Option<Arc<dyn Service>> { None }),
        ))
    }

    async fn next(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_message_types_are_skipped() {
        let (engine, addr, mut events, cancel) = hosting(60).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let request = Message::ServiceRequest(ServiceRequest {
            request_id: Uuid::new_v4(),
            source: PeerId::new_random(),
            destination: engine.local_id(),
            service: "Chat".into(),
        });
        write_frame(&mut stream, &request.encode(), 1024).await.unwrap();
        let reply = read_frame(&mut stream, 1024).await.unwrap().unwrap();
        let Message::ServiceResponse { session_id, .. } = Message::decode(reply).unwrap() else {
            panic!("expected ServiceResponse");
        };
        assert!(matches!(next(&mut events).await, SessionEvent::Started { .. }));

        // tag 9 with no session id and a zero timestamp
        write_frame(&mut stream, &[9, 0, 0, 0, 0, 0, 0, 0, 0, 0], 1024)
            .await
            .unwrap();
        let data = Message::SessionData {
            session_id: Some(session_id),
            payload: Bytes::from_static(b"still here"),
        };
        write_frame(&mut stream, &data.encode(), 1024).await.unwrap();

        match next(&mut events).await {
            SessionEvent::Data { payload, .. } => assert_eq!(&payload[..], b"still here"),
            other => panic!("expected Data, got {:?}", other),
        }
        assert_eq!(engine.registry().len(), 1);

        drop(stream);
        assert!(matches!(next(&mut events).await, SessionEvent::Closed { .. }));
        assert!(engine.registry().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn expired_session_ends_on_next_data() {
        let (server, addr, mut server_events, cancel) = hosting(0).await;
        let client = client_engine();

        let (local, mut client_events) = ChannelService::new("Chat", 16);
        let session = client
            .connect(addr, server.local_id(), local)
            .await
            .unwrap();
        assert!(matches!(next(&mut server_events).await, SessionEvent::Started { .. }));
        assert!(matches!(next(&mut client_events).await, SessionEvent::Started { .. }));

        session.send(&b"too late"[..]).await.unwrap();

        // the server drops the data and closes; the client observes the close
        assert!(matches!(next(&mut server_events).await, SessionEvent::Closed { .. }));
        assert!(matches!(next(&mut client_events).await, SessionEvent::Closed { .. }));
        assert!(server.registry().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn client_lifetime_ignores_server_clock() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let session_id = SessionId::new_random();

        // a server whose clock runs 31 minutes behind ours
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream, 1024).await.unwrap().unwrap();
            assert!(matches!(
                Message::decode(request).unwrap(),
                Message::ServiceRequest(_)
            ));
            let response = Message::ServiceResponse {
                session_id,
                expires_at: unix_millis() as i64 - 31 * 60 * 1000,
            };
            write_frame(&mut stream, &response.encode(), 1024).await.unwrap();
            let data = Message::SessionData {
                session_id: Some(session_id),
                payload: Bytes::from_static(b"hi"),
            };
            write_frame(&mut stream, &data.encode(), 1024).await.unwrap();
            stream
        });

        let client = client_engine();
        let (local, mut events) = ChannelService::new("Chat", 16);
        let session = client
            .connect(addr, PeerId::new_random(), local)
            .await
            .unwrap();
        assert_eq!(session.id(), session_id);

        assert!(matches!(next(&mut events).await, SessionEvent::Started { .. }));
        match next(&mut events).await {
            SessionEvent::Data { payload, .. } => assert_eq!(&payload[..], b"hi"),
            other => panic!("expected Data, got {:?}", other),
        }
        assert!(client.outbound_registry().try_get(&session_id).is_some());
        assert!(!session.is_closed());

        let _stream = server.await.unwrap();
    }

    #[tokio::test]
    async fn engine_can_open_a_session_to_itself() {
        let (engine, addr, mut hosted, cancel) = hosting(60).await;
        let (local, mut events) = ChannelService::new("Chat", 16);

        let session = engine
            .connect(addr, engine.local_id(), local)
            .await
            .unwrap();
        assert!(matches!(next(&mut events).await, SessionEvent::Started { .. }));
        match next(&mut hosted).await {
            SessionEvent::Started { session: accepted, remote_peer } => {
                assert_eq!(accepted.id(), session.id());
                assert_eq!(remote_peer, engine.local_id());
            }
            other => panic!("expected Started, got {:?}", other),
        }

        session.send(&b"hi"[..]).await.unwrap();
        match next(&mut hosted).await {
            SessionEvent::Data { payload, .. } => assert_eq!(&payload[..], b"hi"),
            other => panic!("expected Data, got {:?}", other),
        }
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(engine.outbound_registry().len(), 1);
        cancel.cancel();
    }
}
