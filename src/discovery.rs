//! ZCDP: periodic UDP multicast announcements of identity and hosted services.
//!
//! Datagram header: `[version:2][msgType:4][msgId:8][peerId:16]`.
//! Announce body: `[hostName:str][serviceCount:8]` followed by
//! `serviceCount` × `(name:str, address:str, port:2, metadata:str)`.
//! Goodbye has no body. Integers are little-endian and `str` is
//! `[len:4][utf8]`, the same encoding the session protocol uses.

use local_ip_address::{list_afinet_netifas, local_ip};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::codec::{ensure, get_string, get_uuid, put_string, put_uuid};
use crate::config::DiscoveryConfig;
use crate::directory::PeerDirectory;
use crate::error::{Result, ZerolinkError};
use crate::peer::{PeerId, ServiceAdvertisement};
use crate::service::ServiceDirectory;

pub const PROTOCOL_VERSION: u16 = 1;

const MAX_DATAGRAM: usize = 65_507;
// name, address and metadata length prefixes plus the port
const MIN_SERVICE_LEN: usize = 4 + 4 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiscoveryMessageType {
    Announce = 1,
    Goodbye = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryHeader {
    pub version: u16,
    pub msg_type: u32,
    pub msg_id: u64,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub host_name: String,
    pub services: Vec<ServiceAdvertisement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    Announce(Announce),
    Goodbye,
}

fn put_header(buf: &mut BytesMut, msg_type: DiscoveryMessageType, msg_id: u64, peer_id: &PeerId) {
    buf.put_u16_le(PROTOCOL_VERSION);
    buf.put_u32_le(msg_type as u32);
    buf.put_u64_le(msg_id);
    put_uuid(buf, &peer_id.0);
}

pub fn encode_announce(msg_id: u64, peer_id: &PeerId, announce: &Announce) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    put_header(&mut buf, DiscoveryMessageType::Announce, msg_id, peer_id);
    put_string(&mut buf, &announce.host_name);
    buf.put_u64_le(announce.services.len() as u64);
    for service in &announce.services {
        put_string(&mut buf, &service.name);
        put_string(&mut buf, &service.address);
        buf.put_u16_le(service.port);
        put_string(&mut buf, &service.metadata);
    }
    buf.to_vec()
}

pub fn encode_goodbye(msg_id: u64, peer_id: &PeerId) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(30);
    put_header(&mut buf, DiscoveryMessageType::Goodbye, msg_id, peer_id);
    buf.to_vec()
}

pub fn decode_header(buf: &mut &[u8]) -> Result<DiscoveryHeader> {
    ensure(&*buf, 2 + 4 + 8, "discovery header")?;
    let version = buf.get_u16_le();
    let msg_type = buf.get_u32_le();
    let msg_id = buf.get_u64_le();
    let peer_id = PeerId(get_uuid(buf, "peer id")?);
    Ok(DiscoveryHeader {
        version,
        msg_type,
        msg_id,
        peer_id,
    })
}

/// Decode the body that follows `header`.
pub fn decode_body(header: &DiscoveryHeader, buf: &mut &[u8]) -> Result<DiscoveryMessage> {
    if header.version != PROTOCOL_VERSION {
        return Err(ZerolinkError::InvalidMessage(format!(
            "unsupported discovery version {}",
            header.version
        )));
    }

    match header.msg_type {
        t if t == DiscoveryMessageType::Announce as u32 => {
            let host_name = get_string(buf, "host name")?;
            ensure(&*buf, 8, "service count")?;
            let count = buf.get_u64_le();
            if count > (buf.remaining() / MIN_SERVICE_LEN) as u64 {
                return Err(ZerolinkError::InvalidMessage(format!(
                    "service count {} exceeds datagram size",
                    count
                )));
            }

            let mut services = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = get_string(buf, "service name")?;
                let address = get_string(buf, "service address")?;
                ensure(&*buf, 2, "service port")?;
                let port = buf.get_u16_le();
                let metadata = get_string(buf, "service metadata")?;
                services.push(ServiceAdvertisement {
                    name,
                    address,
                    port,
                    metadata,
                });
            }
            Ok(DiscoveryMessage::Announce(Announce {
                host_name,
                services,
            }))
        }
        t if t == DiscoveryMessageType::Goodbye as u32 => Ok(DiscoveryMessage::Goodbye),
        other => Err(ZerolinkError::UnknownMessageType(other)),
    }
}

/// Bind the discovery port and join `group` on every usable IPv4 interface.
pub fn bind_multicast(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    // Our own datagrams never come back; the peer-id check covers other paths
    socket.set_multicast_loop_v4(false)?;

    let mut joined = 0;
    match list_afinet_netifas() {
        Ok(interfaces) => {
            for (name, ip) in interfaces {
                let IpAddr::V4(v4) = ip else { continue };
                if v4.is_loopback() || v4.is_unspecified() {
                    continue;
                }
                match socket.join_multicast_v4(&group, &v4) {
                    Ok(()) => {
                        tracing::debug!("Joined {} on {} ({})", group, name, v4);
                        joined += 1;
                    }
                    Err(e) => tracing::debug!("Could not join {} on {}: {}", group, name, e),
                }
            }
        }
        Err(e) => tracing::warn!("Failed to list network interfaces: {}", e),
    }

    if joined == 0 {
        tracing::info!("No interface joined {}, using default membership", group);
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    }

    UdpSocket::from_std(socket.into())
}

pub struct DiscoveryEngine {
    local_id: PeerId,
    host_name: String,
    config: DiscoveryConfig,
    directory: Arc<PeerDirectory>,
    services: Arc<ServiceDirectory>,
    session_addr: SocketAddr,
    next_msg_id: AtomicU64,
}

impl DiscoveryEngine {
    /// `session_addr` is the engine's listening address, announced for every hosted service.
    pub fn new(
        local_id: PeerId,
        host_name: String,
        config: DiscoveryConfig,
        directory: Arc<PeerDirectory>,
        services: Arc<ServiceDirectory>,
        session_addr: SocketAddr,
    ) -> Self {
        Self {
            local_id,
            host_name,
            config,
            directory,
            services,
            session_addr,
            next_msg_id: AtomicU64::new(rand::random::<u32>() as u64),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Join the configured group and tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let socket = bind_multicast(self.config.multicast_group, self.config.port)?;
        let target = SocketAddr::from((self.config.multicast_group, self.config.port));
        tracing::info!(
            "Discovery announcing as {} ({}) to {}",
            self.host_name,
            self.local_id,
            target
        );
        self.run_on(socket, target, cancel).await;
        Ok(())
    }

    /// Tick loop over an already-bound socket, announcing to `target`.
    pub async fn run_on(&self, socket: UdpSocket, target: SocketAddr, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.drain(&socket);
            self.directory.age_out(self.config.stale_after());

            let announce = self.build_announce();
            if let Err(e) = socket.send_to(&announce, target).await {
                tracing::warn!("Failed to send announcement: {}", e);
            }
        }

        let goodbye = encode_goodbye(self.next_msg_id(), &self.local_id);
        if let Err(e) = socket.send_to(&goodbye, target).await {
            tracing::debug!("Failed to send goodbye: {}", e);
        }
        tracing::info!("Discovery stopped");
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Read every datagram already queued, without waiting for more.
    fn drain(&self, socket: &UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    if let Err(e) = self.handle_datagram(&buf[..len], from) {
                        tracing::debug!("Skipping datagram from {}: {}", from, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("Discovery receive failed: {}", e);
                    break;
                }
            }
        }
    }

    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Result<()> {
        let mut buf = datagram;
        let header = decode_header(&mut buf)?;
        if header.peer_id == self.local_id {
            return Ok(());
        }

        match decode_body(&header, &mut buf)? {
            DiscoveryMessage::Announce(announce) => {
                self.directory.upsert_announce(
                    header.peer_id,
                    from.ip(),
                    announce.host_name,
                    announce.services,
                );
            }
            DiscoveryMessage::Goodbye => {
                self.directory.mark_offline(&header.peer_id);
            }
        }
        Ok(())
    }

    pub fn build_announce(&self) -> Vec<u8> {
        let ip = if self.session_addr.ip().is_unspecified() {
            local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            self.session_addr.ip()
        };
        let announce = Announce {
            host_name: self.host_name.clone(),
            services: self
                .services
                .advertisements(&ip.to_string(), self.session_addr.port()),
        };
        encode_announce(self.next_msg_id(), &self.local_id, &announce)
    }
}
