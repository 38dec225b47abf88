//! # Courier DHT
//!
//! Kademlia distributed hash table for content-addressed packet storage.
//!
//! ## Features
//!
//! - **Routing**: 256 k-buckets indexed by shared-prefix length plus a
//!   sibling bucket of the globally closest peers
//! - **Backoff**: unresponsive peers are locked out for exponentially
//!   growing periods instead of being dropped
//! - **Iterative lookup**: rounds of parallel `FindClosePeers` requests,
//!   bounded in rounds and time
//! - **Replicated store**: proof-of-work stamped store requests sent to the
//!   K closest peers, fire and forget
//! - **Secure deletion**: packets are deleted only with the capability token
//!   matching their published verification hash
//!
//! ## Architecture
//!
//! [`KademliaDht`] sits on top of a [`SendQueue`](courier_transport::SendQueue)
//! and registers itself as a packet listener. Local packets live in one
//! [`DhtStorageHandler`] per packet type.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod bucket;
pub mod config;
pub mod dht;
pub mod error;
pub mod lookup;
pub mod peer;
pub mod peer_file;
pub mod routing_table;
pub mod storage;

pub use bucket::{Bucket, InsertOutcome};
pub use config::DhtConfig;
pub use dht::{DhtStats, KademliaDht, StoreReceipt};
pub use error::{DhtError, Result};
pub use lookup::{ClosestPeersLookup, LookupParams};
pub use peer::DhtPeer;
pub use peer_file::PeerFile;
pub use routing_table::{RoutingTable, RoutingTableStats};
pub use storage::{
    DeleteRequest, DeletionLog, DhtStorageHandler, DirectoryEntryFolder, EmailPacketFolder,
    IndexPacketFolder, PacketFolder, PacketStorage, StoreOutcome,
};

/// Capacity of a k-bucket and number of replicas per stored packet
pub const K: usize = 20;

/// Capacity of the sibling bucket
pub const S: usize = 100;

/// Peers queried in parallel per lookup round
pub const ALPHA: usize = 10;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::DhtConfig;
    pub use crate::dht::{KademliaDht, StoreReceipt};
    pub use crate::error::{DhtError, Result};
    pub use crate::storage::{DhtStorageHandler, StoreOutcome};
}
