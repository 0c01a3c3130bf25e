//! Multicast DNS (RFC 6762) and DNS Service Discovery (RFC 6763) discovery engine.
//!
//! [`Engine`] browses for service types, resolves instances to host, port, addresses and TXT
//! metadata, and keeps a TTL-bound cache of what it found. Results are delivered to a
//! [`HostNotifier`] on the engine's event loop thread.
//!
//! The protocol layers below the engine are usable on their own: [`packet`] is the wire codec,
//! [`scheduler`] and [`resolver`] are I/O-free state machines, and [`service::advertising`]
//! answers queries for locally published services.

use std::net::{Ipv4Addr, Ipv6Addr};

pub mod cache;
pub mod engine;
mod error;
mod hex;
pub mod name;
pub mod packet;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod transport;

pub use engine::{Engine, EngineConfig, HostNotifier, Subscription};
pub use error::{Error, ErrorKind};

/// UDP port used by mDNS.
pub const MDNS_PORT: u16 = 5353;

/// IPv4 multicast group of mDNS.
pub const MDNS_V4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Link-local IPv6 multicast group of mDNS.
pub const MDNS_V6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);
