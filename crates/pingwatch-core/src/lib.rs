//! pingwatch-core: peer liveness from inbound ICMP echo requests.
//!
//! This crate provides:
//! - JSON configuration with global defaults and per-peer overrides
//! - An ordered peer registry routing source addresses to peers
//! - The four-state hysteresis machine behind every peer
//! - The monitor: packet ingestion plus the periodic check loop
//! - Events and the `Notifier` seam they leave through
//!
//! Packet capture and webhook delivery live in the daemon crate, behind the
//! `PacketSource` and `Notifier` traits.

pub mod config;
pub mod event;
pub mod monitor;
pub mod notify;
pub mod peer;
pub mod registry;
pub mod state;

pub use config::{Config, ConfigError, PeerConfig};
pub use event::{Event, EventError};
pub use monitor::{
    Checker, Monitor, MonitorError, MonitorHandle, MonitorSettings, PacketSource, SourceCloser,
};
pub use notify::{Dispatch, Notifier};
pub use peer::{Peer, PeerId, WebhookTarget};
pub use registry::{PeerRegistry, RegistryError};
pub use state::{PeerState, Thresholds};
