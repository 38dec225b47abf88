//! Routing table persistence
//!
//! Known peers are written one base64 identity per line so a restarted node
//! can bootstrap without outside help.

use std::fs;
use std::path::{Path, PathBuf};

use courier_core::PeerIdentity;
use tracing::{debug, warn};

use crate::error::Result;

/// Plain-text file of peer identities
#[derive(Clone, Debug)]
pub struct PeerFile {
    path: PathBuf,
}

impl PeerFile {
    /// Peer file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all identities. A missing file yields an empty list; lines that
    /// do not parse are skipped.
    pub fn load(&self) -> Result<Vec<PeerIdentity>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut peers = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match PeerIdentity::from_base64(line) {
                Ok(peer) => peers.push(peer),
                Err(e) => warn!(
                    "Skipping bad peer at {}:{}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ),
            }
        }
        debug!("Loaded {} peers from {}", peers.len(), self.path.display());
        Ok(peers)
    }

    /// Replace the file with `peers`
    pub fn save(&self, peers: &[PeerIdentity]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut contents = String::with_capacity(peers.len() * 64);
        for peer in peers {
            contents.push_str(&peer.to_base64());
            contents.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved {} peers to {}", peers.len(), self.path.display());
        Ok(())
    }
}
