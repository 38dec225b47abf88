//! Hashcash-style proof-of-work stamps
//!
//! A stamp has the form `1:<bits>:<yymmdd>:<resource>::<rand>:<counter>` and
//! is valid when the SHA-256 hash of the whole string starts with at least
//! `<bits>` zero bits. Store and relay requests carry a stamp bound to the
//! content they submit, so a stamp cannot be replayed for another packet.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{NaiveDate, Utc};
use rand::RngCore;

use crate::error::{CryptoError, Result};
use crate::hash::{leading_zero_bits, sha256, sha256_parts};

const STAMP_VERSION: &str = "1";
const DATE_FORMAT: &str = "%y%m%d";
const SALT_BYTES: usize = 12;

/// Upper bound on the work a stamp may claim; minting beyond this is not
/// practical and parsing rejects it.
pub const MAX_BITS: u32 = 64;

/// A minted or received proof-of-work stamp
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashcashStamp {
    bits: u32,
    date: NaiveDate,
    resource: String,
    salt: String,
    counter: u64,
}

impl HashcashStamp {
    /// Mint a stamp for `resource` dated today.
    ///
    /// This is CPU bound: expect roughly `2^bits` hash evaluations. Async
    /// callers should run it on a blocking thread.
    pub fn mint(resource: &str, bits: u32) -> Self {
        Self::mint_on(resource, bits, Utc::now().date_naive())
    }

    /// Mint a stamp with an explicit date
    pub fn mint_on(resource: &str, bits: u32, date: NaiveDate) -> Self {
        let bits = bits.min(MAX_BITS);
        let mut salt = [0u8; SALT_BYTES];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut stamp = Self {
            bits,
            date,
            resource: resource.to_string(),
            salt: URL_SAFE_NO_PAD.encode(salt),
            counter: 0,
        };

        let prefix = stamp.prefix();
        loop {
            let counter = format!("{:x}", stamp.counter);
            let hash = sha256_parts(&[prefix.as_bytes(), counter.as_bytes()]);
            if leading_zero_bits(&hash) >= bits {
                return stamp;
            }
            stamp.counter += 1;
        }
    }

    /// Resource string for an arbitrary byte identifier
    pub fn resource_for(bytes: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Work claimed by the stamp
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Date the stamp was minted on
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Resource the stamp is bound to
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Work actually contained in the stamp
    pub fn value(&self) -> u32 {
        leading_zero_bits(&sha256(self.to_string().as_bytes()))
    }

    /// Check the stamp against a resource, a minimum cost and a date window
    pub fn verify(
        &self,
        resource: &str,
        required_bits: u32,
        today: NaiveDate,
        validity_days: i64,
    ) -> Result<()> {
        if self.resource != resource {
            return Err(CryptoError::ResourceMismatch {
                expected: resource.to_string(),
                actual: self.resource.clone(),
            });
        }

        if self.bits < required_bits {
            return Err(CryptoError::InsufficientWork {
                required: required_bits,
                actual: self.bits,
            });
        }

        let actual = self.value();
        if actual < self.bits {
            return Err(CryptoError::InsufficientWork {
                required: self.bits,
                actual,
            });
        }

        let age = (today - self.date).num_days();
        if age.abs() > validity_days {
            return Err(CryptoError::StampExpired(format!(
                "stamp dated {} is {} days away from {}",
                self.date, age, today
            )));
        }

        Ok(())
    }

    fn prefix(&self) -> String {
        format!(
            "{}:{}:{}:{}::{}:",
            STAMP_VERSION,
            self.bits,
            self.date.format(DATE_FORMAT),
            self.resource,
            self.salt
        )
    }
}

impl fmt::Display for HashcashStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:x}", self.prefix(), self.counter)
    }
}

impl FromStr for HashcashStamp {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 7 {
            return Err(CryptoError::InvalidStamp(format!(
                "expected 7 fields, got {}",
                parts.len()
            )));
        }
        if parts[0] != STAMP_VERSION {
            return Err(CryptoError::InvalidStamp(format!(
                "unsupported version {}",
                parts[0]
            )));
        }

        let bits: u32 = parts[1]
            .parse()
            .map_err(|_| CryptoError::InvalidStamp(format!("bad bit count {}", parts[1])))?;
        if bits > MAX_BITS {
            return Err(CryptoError::InvalidStamp(format!("bit count {} too large", bits)));
        }

        let date = NaiveDate::parse_from_str(parts[2], DATE_FORMAT)
            .map_err(|e| CryptoError::InvalidStamp(format!("bad date {}: {}", parts[2], e)))?;

        if !parts[4].is_empty() {
            return Err(CryptoError::InvalidStamp("extensions are not supported".to_string()));
        }

        let counter = u64::from_str_radix(parts[6], 16)
            .map_err(|_| CryptoError::InvalidStamp(format!("bad counter {}", parts[6])))?;

        Ok(Self {
            bits,
            date,
            resource: parts[3].to_string(),
            salt: parts[5].to_string(),
            counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[test]
    fn test_mint_and_verify() {
        let stamp = HashcashStamp::mint("resource", 8);
        assert!(stamp.value() >= 8);
        stamp.verify("resource", 8, today(), 2).unwrap();
    }

    #[test]
    fn test_parse_round_trip_keeps_work() {
        let stamp = HashcashStamp::mint("abc", 10);
        let parsed: HashcashStamp = stamp.to_string().parse().unwrap();
        assert_eq!(parsed, stamp);
        parsed.verify("abc", 10, today(), 2).unwrap();
    }

    #[test]
    fn test_rejects_other_resource() {
        let stamp = HashcashStamp::mint("abc", 4);
        assert!(matches!(
            stamp.verify("xyz", 4, today(), 2),
            Err(CryptoError::ResourceMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_cheap_stamp() {
        let stamp = HashcashStamp::mint("abc", 4);
        assert!(matches!(
            stamp.verify("abc", 12, today(), 2),
            Err(CryptoError::InsufficientWork { required: 12, actual: 4 })
        ));
    }

    #[test]
    fn test_rejects_inflated_claim() {
        let stamp = HashcashStamp::mint("abc", 4);
        // Claim far more work than was done
        let forged = stamp.to_string().replacen(":4:", ":40:", 1);
        let forged: HashcashStamp = forged.parse().unwrap();
        assert!(forged.verify("abc", 8, today(), 2).is_err());
    }

    #[test]
    fn test_rejects_old_stamp() {
        let old = today() - chrono::Duration::days(10);
        let stamp = HashcashStamp::mint_on("abc", 4, old);
        assert!(matches!(
            stamp.verify("abc", 4, today(), 2),
            Err(CryptoError::StampExpired(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<HashcashStamp>().is_err());
        assert!("2:8:240101:r::s:0".parse::<HashcashStamp>().is_err());
        assert!("1:x:240101:r::s:0".parse::<HashcashStamp>().is_err());
        assert!("1:8:2401:r::s:0".parse::<HashcashStamp>().is_err());
        assert!("1:8:240101:r:ext:s:0".parse::<HashcashStamp>().is_err());
        assert!("1:99:240101:r::s:0".parse::<HashcashStamp>().is_err());
    }
}
