//! Persistent relay queue
//!
//! Every queued packet is one file named `<send time millis>_<payload hash>`
//! holding a bincode [`StoredRelay`]. The zero-padded time prefix lets the
//! sender find due entries from the directory listing alone.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use courier_core::{Hash256, PeerIdentity, Timestamp};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// On-disk form of a queued packet
#[derive(Serialize, Deserialize)]
struct StoredRelay {
    destination: Vec<u8>,
    packet: Vec<u8>,
    queued_at: Timestamp,
}

/// A packet waiting to be forwarded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedRelay {
    /// Queue file name, used to remove the entry
    pub id: String,
    /// Earliest time the packet may be sent
    pub send_time: Timestamp,
    /// When the packet entered the queue
    pub queued_at: Timestamp,
    /// Next hop
    pub destination: PeerIdentity,
    /// Encoded communication packet to send
    pub packet: Bytes,
}

/// Directory-backed queue of packets awaiting forwarding.
///
/// All methods do blocking file I/O; async callers go through
/// `spawn_blocking`.
#[derive(Clone, Debug)]
pub struct RelayQueue {
    dir: PathBuf,
}

impl RelayQueue {
    /// Open (creating if needed) the queue directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Queue directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Add `packet` for `destination`, due at `send_time`. Returns the entry id.
    pub fn enqueue(
        &self,
        destination: &PeerIdentity,
        packet: &[u8],
        send_time: Timestamp,
    ) -> Result<String> {
        let id = format!(
            "{:013}_{}",
            send_time.as_millis().max(0),
            Hash256::digest(packet).to_base64()
        );
        let stored = StoredRelay {
            destination: destination.as_bytes().to_vec(),
            packet: packet.to_vec(),
            queued_at: Timestamp::now(),
        };

        let path = self.dir.join(&id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bincode::serialize(&stored)?)?;
        fs::rename(&tmp, &path)?;
        debug!("Queued relay packet {} for {}", id, destination);
        Ok(id)
    }

    /// Entries whose send time is at or before `now`, oldest first
    pub fn due(&self, now: Timestamp) -> Result<Vec<QueuedRelay>> {
        self.load_where(|send_time| send_time <= now)
    }

    /// Every queued entry, oldest first
    pub fn all(&self) -> Result<Vec<QueuedRelay>> {
        self.load_where(|_| true)
    }

    /// Number of queued entries
    pub fn len(&self) -> Result<usize> {
        Ok(self.entry_names()?.len())
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove an entry; returns whether it existed
    pub fn remove(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.dir.join(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop entries queued more than `max_age` before `now`
    pub fn expire(&self, max_age: Duration, now: Timestamp) -> Result<usize> {
        let cutoff = now.minus(max_age);
        let mut removed = 0;
        for entry in self.all()? {
            if entry.queued_at < cutoff && self.remove(&entry.id)? {
                debug!("Expired relay packet {}", entry.id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn entry_names(&self) -> Result<Vec<(Timestamp, String)>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Some(send_time) = parse_send_time(&name) {
                names.push((send_time, name));
            }
        }
        names.sort();
        Ok(names)
    }

    fn load_where(&self, keep: impl Fn(Timestamp) -> bool) -> Result<Vec<QueuedRelay>> {
        let mut entries = Vec::new();
        for (send_time, id) in self.entry_names()? {
            if !keep(send_time) {
                continue;
            }
            match self.load(&id, send_time) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => {
                    warn!("Removing unreadable relay packet {}: {}", id, e);
                    self.remove(&id)?;
                }
            }
        }
        Ok(entries)
    }

    fn load(&self, id: &str, send_time: Timestamp) -> Result<Option<QueuedRelay>> {
        let bytes = match fs::read(self.dir.join(id)) {
            Ok(bytes) => bytes,
            // removed by a concurrent sender pass
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredRelay = bincode::deserialize(&bytes)?;
        Ok(Some(QueuedRelay {
            id: id.to_string(),
            send_time,
            queued_at: stored.queued_at,
            destination: PeerIdentity::new(stored.destination)?,
            packet: Bytes::from(stored.packet),
        }))
    }
}

fn parse_send_time(name: &str) -> Option<Timestamp> {
    let (millis, hash) = name.split_once('_')?;
    if hash.is_empty() || hash.contains('.') {
        return None;
    }
    millis.parse().ok().map(Timestamp::from_millis)
}

/// Randomized send time for a packet that asked for `delay`.
///
/// The actual delay is drawn uniformly from `delay/2 ..= delay*3/2` and
/// capped at `max_delay`.
pub fn schedule_send_time(delay: Duration, max_delay: Duration, now: Timestamp) -> Timestamp {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let low = millis / 2;
    let high = millis.saturating_add(millis / 2);
    let jittered = rand::thread_rng().gen_range(low..=high);
    now.plus(Duration::from_millis(jittered).min(max_delay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_due_entries_in_order() {
        let dir = tempdir().unwrap();
        let queue = RelayQueue::open(dir.path()).unwrap();
        let dest = PeerIdentity::random();
        let now = Timestamp::now();

        let late = queue
            .enqueue(&dest, b"late", now.plus(Duration::from_secs(60)))
            .unwrap();
        let second = queue
            .enqueue(&dest, b"second", now.minus(Duration::from_secs(1)))
            .unwrap();
        let first = queue
            .enqueue(&dest, b"first", now.minus(Duration::from_secs(5)))
            .unwrap();

        let due = queue.due(now).unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(due[0].destination, dest);
        assert_eq!(&due[0].packet[..], b"first");
        assert_eq!(queue.len().unwrap(), 3);

        assert!(queue.remove(&late).unwrap());
        assert!(!queue.remove(&late).unwrap());
        assert_eq!(queue.all().unwrap().len(), 2);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let dest = PeerIdentity::random();
        let id = RelayQueue::open(dir.path())
            .unwrap()
            .enqueue(&dest, b"packet", Timestamp::now())
            .unwrap();

        let reopened = RelayQueue::open(dir.path()).unwrap();
        let all = reopened.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
    }

    #[test]
    fn test_expire_drops_old_entries() {
        let dir = tempdir().unwrap();
        let queue = RelayQueue::open(dir.path()).unwrap();
        queue
            .enqueue(&PeerIdentity::random(), b"packet", Timestamp::now())
            .unwrap();

        let now = Timestamp::now();
        assert_eq!(queue.expire(Duration::from_secs(3600), now).unwrap(), 0);
        let later = now.plus(Duration::from_secs(7200));
        assert_eq!(queue.expire(Duration::from_secs(3600), later).unwrap(), 1);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_corrupt_entry_removed() {
        let dir = tempdir().unwrap();
        let queue = RelayQueue::open(dir.path()).unwrap();
        fs::write(dir.path().join("0000000000001_garbage"), b"\x01\x02").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert!(queue.due(Timestamp::now()).unwrap().is_empty());
        assert_eq!(queue.len().unwrap(), 0);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_schedule_within_bounds() {
        let now = Timestamp::from_millis(1_000_000);
        let max = Duration::from_secs(3600);
        for _ in 0..200 {
            let at = schedule_send_time(Duration::from_secs(10), max, now);
            let delay = at.since(now);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(15));
        }
        assert_eq!(schedule_send_time(Duration::ZERO, max, now), now);

        let capped = schedule_send_time(Duration::from_secs(10 * 3600), max, now);
        assert_eq!(capped.since(now), max);
    }
}
