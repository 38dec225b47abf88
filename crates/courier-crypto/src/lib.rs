//! # Courier Crypto
//!
//! Cryptographic primitives used by the Courier DHT:
//!
//! - **Content hashing**: SHA-256 helpers for DHT keys and peer ids
//! - **Proof of work**: hashcash-style stamps gating store and relay requests
//! - **Delete authorization**: capability tokens whose hash is published
//!   alongside stored content
//! - **Signatures**: Ed25519 signing of directory entries

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod delete_auth;
pub mod error;
pub mod hash;
pub mod hashcash;
pub mod signing;

pub use delete_auth::DeleteAuthorization;
pub use error::{CryptoError, Result};
pub use hash::{leading_zero_bits, sha256, sha256_parts};
pub use hashcash::HashcashStamp;
pub use signing::{verify_signature, DirectorySigner};

/// Length of every hash produced by this crate
pub const HASH_LENGTH: usize = 32;
