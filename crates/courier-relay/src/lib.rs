//! # Courier Relay
//!
//! Store-and-forward relaying on top of the Courier DHT. A relay request
//! wraps either a store request or another relay request:
//!
//! - **Stores** are handed to a bounded [`StoreWorkerPool`] that writes the
//!   packet into the DHT off the receive path.
//! - **Nested relays** are written to a persistent [`RelayQueue`] with a
//!   randomized send time and forwarded later by the [`RelaySender`].
//!
//! The immediate sender is always answered before either happens.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod handler;
pub mod queue;
pub mod sender;
pub mod worker;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use handler::RelayPacketHandler;
pub use queue::{schedule_send_time, QueuedRelay, RelayQueue};
pub use sender::RelaySender;
pub use worker::{PacketStore, StoreWorkerPool};

/// Default number of store workers
pub const DEFAULT_STORE_WORKERS: usize = 2;

/// Default number of relayed stores waiting for a worker
pub const DEFAULT_STORE_QUEUE_CAPACITY: usize = 64;
