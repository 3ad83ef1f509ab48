//! Peers heard on the discovery channel and the services they advertise.

use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::peer::{unix_millis, PeerId, PeerRecord, PeerStatus, ServiceAdvertisement};

/// Change notifications for GUI and persistence consumers.
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    PeerUpdated {
        peer: PeerRecord,
        services: Vec<ServiceAdvertisement>,
    },
    PeerOffline(PeerId),
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    record: PeerRecord,
    services: Vec<ServiceAdvertisement>,
}

pub struct PeerDirectory {
    peers: DashMap<PeerId, DirectoryEntry>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            peers: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    /// Create or refresh the record for `id` and replace its service list.
    pub fn upsert_announce(
        &self,
        id: PeerId,
        ip: IpAddr,
        host_name: String,
        services: Vec<ServiceAdvertisement>,
    ) -> PeerRecord {
        let now = unix_millis();
        let record = {
            let mut entry = self.peers.entry(id).or_insert_with(|| {
                tracing::info!("Discovered peer {} ({}) at {}", host_name, id, ip);
                DirectoryEntry {
                    record: PeerRecord {
                        id,
                        ip,
                        host_name: host_name.clone(),
                        last_seen: now,
                        status: PeerStatus::Unknown,
                    },
                    services: Vec::new(),
                }
            });
            entry.record.ip = ip;
            entry.record.host_name = host_name;
            entry.record.last_seen = now;
            entry.record.status = PeerStatus::Online;
            entry.services = services.clone();
            entry.record.clone()
        };

        let _ = self.events.send(DirectoryEvent::PeerUpdated {
            peer: record.clone(),
            services,
        });
        record
    }

    pub fn mark_offline(&self, id: &PeerId) -> bool {
        let changed = match self.peers.get_mut(id) {
            Some(mut entry) if entry.record.status != PeerStatus::Offline => {
                entry.record.status = PeerStatus::Offline;
                true
            }
            _ => false,
        };
        if changed {
            tracing::info!("Peer {} went offline", id);
            let _ = self.events.send(DirectoryEvent::PeerOffline(*id));
        }
        changed
    }

    /// Mark online peers silent for longer than `stale_after` as offline.
    pub fn age_out(&self, stale_after: Duration) -> Vec<PeerId> {
        self.age_out_at(unix_millis(), stale_after)
    }

    pub(crate) fn age_out_at(&self, now: u64, stale_after: Duration) -> Vec<PeerId> {
        let cutoff = now.saturating_sub(stale_after.as_millis() as u64);
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|e| e.record.status == PeerStatus::Online && e.record.last_seen < cutoff)
            .map(|e| *e.key())
            .collect();

        stale.into_iter().filter(|id| self.mark_offline(id)).collect()
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(id).map(|e| e.record.clone())
    }

    pub fn services(&self, id: &PeerId) -> Vec<ServiceAdvertisement> {
        self.peers
            .get(id)
            .map(|e| e.services.clone())
            .unwrap_or_default()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|e| e.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Where `peer` accepts sessions for `service`.
    ///
    /// An advertised address that does not parse falls back to the
    /// address the announcement came from.
    pub fn resolve_service(&self, peer: &PeerId, service: &str) -> Option<SocketAddr> {
        let entry = self.peers.get(peer)?;
        let ad = entry.services.iter().find(|s| s.name == service)?;
        let ip = ad.address.parse().unwrap_or(entry.record.ip);
        Some(SocketAddr::new(ip, ad.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ad(name: &str, address: &str, port: u16) -> ServiceAdvertisement {
        ServiceAdvertisement {
            name: name.into(),
            address: address.into(),
            port,
            metadata: String::new(),
        }
    }

    #[test]
    fn upsert_keeps_one_record_per_identity() {
        let directory = PeerDirectory::new();
        let id = PeerId::new_random();
        let first = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let second = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        directory.upsert_announce(id, first, "alpha".into(), vec![ad("Chat", "10.0.0.1", 1)]);
        directory.upsert_announce(id, second, "alpha-renamed".into(), vec![]);

        assert_eq!(directory.len(), 1);
        let record = directory.get(&id).unwrap();
        assert_eq!(record.ip, second);
        assert_eq!(record.host_name, "alpha-renamed");
        assert_eq!(record.status, PeerStatus::Online);
        assert!(directory.services(&id).is_empty());
    }

    #[test]
    fn resolves_advertised_service_address() {
        let directory = PeerDirectory::new();
        let id = PeerId::new_random();
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9));
        directory.upsert_announce(
            id,
            ip,
            "host".into(),
            vec![ad("Chat", "192.168.1.20", 4000), ad("Files", "not-an-ip", 4001)],
        );

        assert_eq!(
            directory.resolve_service(&id, "Chat"),
            Some("192.168.1.20:4000".parse().unwrap())
        );
        assert_eq!(
            directory.resolve_service(&id, "Files"),
            Some(SocketAddr::new(ip, 4001))
        );
        assert!(directory.resolve_service(&id, "Nope").is_none());
        assert!(directory
            .resolve_service(&PeerId::new_random(), "Chat")
            .is_none());
    }

    #[test]
    fn silent_peers_age_out_once() {
        let directory = PeerDirectory::new();
        let mut events = directory.subscribe();
        let id = PeerId::new_random();
        let record = directory.upsert_announce(
            id,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "host".into(),
            vec![],
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            DirectoryEvent::PeerUpdated { .. }
        ));

        let stale = Duration::from_secs(15);
        assert!(directory.age_out_at(record.last_seen + 1_000, stale).is_empty());

        let later = record.last_seen + 16_000;
        assert_eq!(directory.age_out_at(later, stale), vec![id]);
        assert_eq!(directory.get(&id).unwrap().status, PeerStatus::Offline);
        assert!(matches!(
            events.try_recv().unwrap(),
            DirectoryEvent::PeerOffline(p) if p == id
        ));
        assert!(directory.age_out_at(later, stale).is_empty());
    }
}
