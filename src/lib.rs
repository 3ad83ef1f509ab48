//! Serverless LAN peer discovery and session protocol.
//!
//! Nodes announce themselves and their services over UDP multicast (ZCDP)
//! and open framed TCP sessions to each other's services (ZCSP). When a
//! coordinator is reachable, outbound traffic is wrapped in routing
//! envelopes and relayed through it instead.

pub mod broker;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod directory;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod framing;
pub mod links;
pub mod logging;
pub mod node;
pub mod peer;
pub mod relay;
pub mod service;
pub mod session;
pub mod storage;

pub use broker::{Delivery, SessionBroker};
pub use codec::{Message, MessageType, RoutingEnvelope};
pub use config::Config;
pub use connectivity::{ConnectivityMode, ConnectivityMonitor};
pub use directory::{DirectoryEvent, PeerDirectory};
pub use discovery::DiscoveryEngine;
pub use engine::PeerEngine;
pub use error::{Result, ZerolinkError};
pub use links::SessionCache;
pub use node::Node;
pub use peer::{PeerId, PeerRecord, PeerStatus, ServiceAdvertisement};
pub use relay::RELAY_SERVICE;
pub use service::{
    ChannelService, EchoService, Service, ServiceDirectory, ServiceResolver, SessionEvent,
    SessionHandle,
};
pub use session::{Session, SessionId, SessionRegistry};
