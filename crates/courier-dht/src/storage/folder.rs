//! One file per packet, named after the packet's DHT key

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use courier_core::{DhtKey, DhtStorablePacket, Hash256, Timestamp};
use tracing::{debug, warn};

use crate::error::{DhtError, Result};

/// Extension of stored packet files
pub const PACKET_EXTENSION: &str = "pkt";

/// Directory of encoded packets.
///
/// Files are named `base64url(key).pkt` and written through a temporary
/// file plus rename so readers never see a partial packet. Total size is
/// tracked against a quota.
#[derive(Debug)]
pub struct PacketFolder {
    dir: PathBuf,
    used_bytes: AtomicU64,
    max_bytes: u64,
}

impl PacketFolder {
    /// Open (creating if needed) the folder at `dir`
    pub fn open(dir: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut used = 0u64;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if is_packet_file(&entry.path()) {
                used += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        debug!("Opened packet folder {} ({} bytes)", dir.display(), used);

        Ok(Self {
            dir,
            used_bytes: AtomicU64::new(used),
            max_bytes,
        })
    }

    /// Folder path
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Bytes currently stored
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// File path for `key`
    pub fn file_for(&self, key: &DhtKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.to_base64(), PACKET_EXTENSION))
    }

    /// Whether a file exists for `key`
    pub fn contains(&self, key: &DhtKey) -> bool {
        self.file_for(key).is_file()
    }

    /// Write `bytes` under `key`, replacing any existing file
    pub fn write(&self, key: &DhtKey, bytes: &[u8]) -> Result<()> {
        let path = self.file_for(key);
        let old_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let new_len = bytes.len() as u64;

        let used = self.used_bytes();
        if new_len > old_len && used + new_len - old_len > self.max_bytes {
            return Err(DhtError::StorageFull {
                used,
                max: self.max_bytes,
            });
        }

        let tmp = self.dir.join(format!(".{}.tmp", key.to_base64()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;

        if new_len >= old_len {
            self.used_bytes.fetch_add(new_len - old_len, Ordering::AcqRel);
        } else {
            self.sub_used(old_len - new_len);
        }
        Ok(())
    }

    /// Read the raw bytes stored under `key`
    pub fn read(&self, key: &DhtKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.file_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and decode the packet under `key`. A file that no longer decodes
    /// is logged and deleted.
    pub fn load(&self, key: &DhtKey) -> Result<Option<DhtStorablePacket>> {
        let path = self.file_for(key);
        match self.read(key)? {
            Some(bytes) => Ok(self.decode_or_discard(&path, &bytes)),
            None => Ok(None),
        }
    }

    /// Delete the file for `key`. Returns whether it existed.
    pub fn delete(&self, key: &DhtKey) -> Result<bool> {
        self.delete_path(&self.file_for(key))
    }

    fn delete_path(&self, path: &Path) -> Result<bool> {
        let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(path) {
            Ok(()) => {
                self.sub_used(len);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn sub_used(&self, amount: u64) {
        // saturating: external edits to the folder can make the counter drift
        let _ = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(amount))
            });
    }

    fn decode_or_discard(&self, path: &Path, bytes: &[u8]) -> Option<DhtStorablePacket> {
        match DhtStorablePacket::decode(bytes) {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!("Deleting corrupt packet file {}: {}", path.display(), e);
                if let Err(e) = self.delete_path(path) {
                    warn!("Could not delete {}: {}", path.display(), e);
                }
                None
            }
        }
    }

    /// Keys of all stored packets with their file modification times
    pub fn entries(&self) -> Result<Vec<(DhtKey, Timestamp)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(key) = key_from_path(&path) else {
                continue;
            };
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(system_time_to_timestamp)
                .unwrap_or_else(|_| Timestamp::now());
            entries.push((key, modified));
        }
        Ok(entries)
    }

    /// Decode every stored packet, deleting files that fail to decode
    pub fn packets(&self) -> Result<Vec<DhtStorablePacket>> {
        let mut packets = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !is_packet_file(&path) {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Skipping unreadable {}: {}", path.display(), e);
                    continue;
                }
            };
            if let Some(packet) = self.decode_or_discard(&path, &bytes) {
                packets.push(packet);
            }
        }
        Ok(packets)
    }

    /// Delete files last written before `cutoff`. Returns the number deleted.
    pub fn delete_older_than(&self, cutoff: Timestamp) -> Result<usize> {
        let mut deleted = 0;
        for (key, modified) in self.entries()? {
            if modified < cutoff && self.delete(&key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn is_packet_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(PACKET_EXTENSION)
}

fn key_from_path(path: &Path) -> Option<DhtKey> {
    if !is_packet_file(path) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Hash256::from_base64(stem).ok()
}

fn system_time_to_timestamp(time: SystemTime) -> Timestamp {
    let millis = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Timestamp::from_millis(millis)
}
