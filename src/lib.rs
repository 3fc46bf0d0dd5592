//! simple-tunnel: multiplexed flow tunneling over a single TCP connection
//!
//! This crate implements a bidirectional tunneling protocol that carries
//! many logical flows — TCP byte streams, UDP datagrams, and raw IP
//! packets — over one reliable byte channel between a client and a
//! server. The server additionally leases virtual IPv4 addresses from a
//! pool and pushes tunnel-level network settings (DNS, routes) to clients.
//!
//! # Architecture
//!
//! ```text
//! Client flows ⇄ TunnelClient ⇄ framed TCP channel ⇄ TunnelServer ⇄ relays
//!                                                                    ├ TCP  → remote host
//!                                                                    ├ UDP  → remote endpoints
//!                                                                    └ IP   → host packet stack
//! ```
//!
//! Every message is a length-prefixed frame holding a typed dictionary;
//! the dispatch core routes messages to flows by identifier, and a
//! save-queue discipline suspends every flow whenever the shared channel
//! falls behind.
//!
//! # Modules
//!
//! - [`message`]: the wire dictionary, command codes, and frame codec
//! - [`tunnel`]: the multiplexing core shared by both endpoints
//! - [`server`]: flow relays and the address pool
//! - [`client`]: flow opening and the client packet-flow pump
//! - [`config`]: the configuration dictionary and its loader
//! - [`packet_flow`]: the host packet interface for IP flows
//! - [`discovery`]: service constants and `host:port` parsing
//! - [`error`]: the error hierarchy
//! - [`io`]: the save-queue writer

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod io;
pub mod message;
pub mod packet_flow;
pub mod server;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use client::{run_packet_flow, ClientFlow, TunnelClient};
pub use config::{
    load_config, load_config_str, DnsSettings, Ipv4Settings, PoolRange, RouteEntry,
    TunnelConfiguration,
};
pub use error::{ConfigError, ConnectionError, FrameError, RelayError, Result, TunnelError};
pub use message::{
    AppFlowKind, CloseDirection, Command, Message, ResultCode, TunnelLayer, Value,
};
pub use packet_flow::{PacketFlow, MAX_PACKETS_PER_MESSAGE, MAX_PACKET_SIZE};
pub use server::{AddressPool, TunnelServer};
pub use tunnel::{
    active_tunnel_count, close_all_tunnels, Connection, FlowEvent, NoDelegate, RoleHandler,
    Tunnel, TunnelDelegate,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
