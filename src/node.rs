//! Wires every component of a node together and owns their background tasks.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::SessionBroker;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::directory::PeerDirectory;
use crate::discovery::{bind_multicast, DiscoveryEngine};
use crate::engine::PeerEngine;
use crate::error::Result;
use crate::peer::PeerId;
use crate::service::ServiceDirectory;
use crate::session::SessionRegistry;
use crate::storage::load_or_create_identity;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Node {
    local_id: PeerId,
    session_addr: SocketAddr,
    directory: Arc<PeerDirectory>,
    services: Arc<ServiceDirectory>,
    engine: Arc<PeerEngine>,
    monitor: Arc<ConnectivityMonitor>,
    broker: Arc<SessionBroker>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the session listener and start discovery, connectivity probing and the accept loop.
    pub async fn start(config: Config, services: Arc<ServiceDirectory>) -> Result<Self> {
        let local_id = load_or_create_identity(&config.node.data_dir)?;
        let host_name = config.node.host_name();

        let directory = Arc::new(PeerDirectory::new());
        let registry = Arc::new(SessionRegistry::new());

        let mut engine = PeerEngine::new(
            local_id,
            config.session.clone(),
            registry.clone(),
            services.resolver(),
        );
        if config.node.coordinator {
            tracing::info!("Coordinator role enabled");
            engine = engine.with_relay(directory.clone());
        }
        let engine = Arc::new(engine);
        let listener = engine.bind().await?;
        let session_addr = listener.local_addr()?;

        let monitor = Arc::new(ConnectivityMonitor::new(&config.connectivity));
        let broker = Arc::new(SessionBroker::new(engine.clone(), monitor.clone()));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(engine.clone().serve(listener, cancel.clone())));

        let discovery = Arc::new(DiscoveryEngine::new(
            local_id,
            host_name.clone(),
            config.discovery.clone(),
            directory.clone(),
            services.clone(),
            session_addr,
        ));
        match bind_multicast(config.discovery.multicast_group, config.discovery.port) {
            Ok(socket) => {
                let target = SocketAddr::V4(SocketAddrV4::new(
                    config.discovery.multicast_group,
                    config.discovery.port,
                ));
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    discovery.run_on(socket, target, cancel).await
                }));
            }
            Err(e) => tracing::error!("Discovery disabled, could not bind multicast socket: {}", e),
        }

        tasks.push(tokio::spawn({
            let (monitor, cancel) = (monitor.clone(), cancel.clone());
            async move { monitor.run(cancel).await }
        }));
        tasks.push(tokio::spawn({
            let (broker, cancel) = (broker.clone(), cancel.clone());
            async move { broker.follow_mode(cancel).await }
        }));
        tasks.push(tokio::spawn({
            let registries = vec![registry, engine.outbound_registry().clone()];
            let cancel = cancel.clone();
            async move { sweep_sessions(registries, cancel).await }
        }));

        tracing::info!(
            "Node {} ({}) up, sessions on {}",
            host_name,
            local_id,
            session_addr
        );

        Ok(Self {
            local_id,
            session_addr,
            directory,
            services,
            engine,
            monitor,
            broker,
            cancel,
            tasks,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn session_addr(&self) -> SocketAddr {
        self.session_addr
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn services(&self) -> &Arc<ServiceDirectory> {
        &self.services
    }

    pub fn engine(&self) -> &Arc<PeerEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.broker
    }

    /// Stop background loops; discovery sends its Goodbye on the way out.
    pub async fn shutdown(self) {
        self.broker.close_all().await;
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Node {} stopped", self.local_id);
    }
}

async fn sweep_sessions(registries: Vec<Arc<SessionRegistry>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reclaimed: usize = registries.iter().map(|r| r.cleanup_expired()).sum();
                if reclaimed > 0 {
                    tracing::debug!("Reclaimed {} expired sessions", reclaimed);
                }
            }
        }
    }
}
