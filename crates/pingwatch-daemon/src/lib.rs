//! pingwatch-daemon library: the I/O halves of the monitor.
//!
//! Thin layer over the daemon components so integration tests can reach
//! them.

pub mod icmp;
pub mod webhook;

pub use icmp::{IcmpCloser, IcmpListener};
pub use webhook::{DeliveryError, WebhookNotifier, user_agent};
