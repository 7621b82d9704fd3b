//! Veripeer peer node: sockets, handshake, verification exchanges and the tracker client.

pub mod channel;
pub mod config;
pub mod node;
pub mod tracker;

pub use channel::{Channel, ChannelError, Role};
pub use config::{Config, ConfigError};
pub use node::{ConnectionInfo, Lifecycle, Node, NodeError, PayloadCache};
pub use tracker::{
    HttpTracker, MemoryTracker, PayloadRecord, PeerAddress, PeerEntry, Tracker, TrackerError,
    TrackerMessage, UploadRequest,
};
