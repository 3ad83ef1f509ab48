//! Decides whether outbound traffic goes direct or through the relay.
//!
//! A reachable relay means the node is on a network where peers are
//! expected to meet at the coordinator, so mode becomes Routed; an
//! unreachable one falls back to Direct.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectivityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectivityMode {
    Direct = 0,
    Routed = 1,
}

impl ConnectivityMode {
    fn from_u8(raw: u8) -> Self {
        if raw == ConnectivityMode::Routed as u8 {
            ConnectivityMode::Routed
        } else {
            ConnectivityMode::Direct
        }
    }
}

pub struct ConnectivityMonitor {
    relay: Option<SocketAddr>,
    poll_interval: Duration,
    probe_timeout: Duration,
    mode: AtomicU8,
    transitions: watch::Sender<ConnectivityMode>,
}

impl ConnectivityMonitor {
    pub fn new(config: &ConnectivityConfig) -> Self {
        let (transitions, _) = watch::channel(ConnectivityMode::Direct);
        Self {
            relay: config.relay,
            poll_interval: config.poll_interval(),
            probe_timeout: config.probe_timeout(),
            mode: AtomicU8::new(ConnectivityMode::Direct as u8),
            transitions,
        }
    }

    pub fn relay(&self) -> Option<SocketAddr> {
        self.relay
    }

    /// Current mode, read fresh on every call.
    pub fn mode(&self) -> ConnectivityMode {
        ConnectivityMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Receiver that observes every mode transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityMode> {
        self.transitions.subscribe()
    }

    /// Probe the relay once and apply the result. Returns the resulting mode.
    pub async fn probe_once(&self) -> ConnectivityMode {
        let reachable = match self.relay {
            Some(relay) => match timeout(self.probe_timeout, TcpStream::connect(relay)).await {
                Ok(Ok(_stream)) => true,
                Ok(Err(e)) => {
                    tracing::debug!("Relay {} unreachable: {}", relay, e);
                    false
                }
                Err(_) => {
                    tracing::debug!("Relay {} probe timed out", relay);
                    false
                }
            },
            None => false,
        };

        let next = if reachable {
            ConnectivityMode::Routed
        } else {
            ConnectivityMode::Direct
        };
        self.set_mode(next);
        next
    }

    fn set_mode(&self, next: ConnectivityMode) {
        let previous = ConnectivityMode::from_u8(self.mode.swap(next as u8, Ordering::AcqRel));
        if previous != next {
            tracing::info!("Connectivity mode {:?} -> {:?}", previous, next);
            // send_replace never fails, even with no receivers
            self.transitions.send_replace(next);
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.probe_once() => {}
            }
        }
        tracing::info!("Connectivity monitor stopped");
    }
}
