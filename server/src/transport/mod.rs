//! Datagram transport: a reliable-UDP host and the reactor thread driving it

pub mod frame;
pub mod host;
pub mod reactor;

pub use host::{HostConfig, PeerStats};
pub use reactor::{
    ConnectCallback, DisconnectKind, InboundEvent, OutboundEvent, Reactor, ReactorConfig, ReactorHandle,
    TransportHandler,
};
