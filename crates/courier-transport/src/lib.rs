//! # Courier Transport
//!
//! Network plumbing underneath the Courier DHT.
//!
//! - **Transport seam**: [`DatagramTransport`] sends opaque datagrams to a
//!   [`PeerIdentity`](courier_core::PeerIdentity); implementations feed
//!   inbound datagrams into a channel.
//! - **Dispatch**: [`PacketDispatcher`] decodes inbound datagrams, keeps the
//!   [`BanList`] current and fans packets out to [`PacketListener`]s.
//! - **Correlation**: [`SendQueue`] sends packets and [`PacketBatch`]es and
//!   routes responses back to the batch that asked.
//! - **Transports**: [`MemoryNetwork`] for simulation and tests,
//!   [`UdpTransport`] for non-anonymous development networks.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod ban_list;
pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod send_queue;
pub mod transport;
pub mod udp;

pub use ban_list::{BanEntry, BanList, BanReason};
pub use batch::PacketBatch;
pub use dispatcher::PacketDispatcher;
pub use error::{Result, TransportError};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use send_queue::SendQueue;
pub use transport::{DatagramTransport, InboundDatagram, PacketListener};
pub use udp::UdpTransport;

/// Capacity of the inbound datagram channel created by transports
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;
