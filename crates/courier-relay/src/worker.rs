//! Bounded pool storing relayed packets in the DHT

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::DhtStorablePacket;
use courier_dht::KademliaDht;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::Result;

/// Destination for packets that arrive inside relayed store requests
#[async_trait]
pub trait PacketStore: Send + Sync {
    /// Store a packet in the network
    async fn store_packet(&self, packet: DhtStorablePacket) -> Result<()>;
}

#[async_trait]
impl PacketStore for KademliaDht {
    async fn store_packet(&self, packet: DhtStorablePacket) -> Result<()> {
        let receipt = self.store(packet).await?;
        debug!(
            "Relayed store of {} reached {} peers",
            receipt.key, receipt.peers_contacted
        );
        Ok(())
    }
}

/// Fixed set of workers draining a bounded queue of store jobs.
///
/// Submitting never waits: when the queue is full the packet is dropped,
/// so a slow DHT cannot stall the receive path.
pub struct StoreWorkerPool {
    tx: mpsc::Sender<DhtStorablePacket>,
}

impl StoreWorkerPool {
    /// Start `workers` tasks with room for `capacity` waiting packets.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn PacketStore>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<DhtStorablePacket>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let store = store.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(packet) = next else {
                        break;
                    };
                    let key = packet.key();
                    if let Err(e) = store.store_packet(packet).await {
                        warn!("Store worker {} failed on {}: {}", worker, key, e);
                    }
                }
                debug!("Store worker {} stopped", worker);
            });
        }

        Self { tx }
    }

    /// Queue a packet for storing; returns false if it was dropped
    pub fn submit(&self, packet: DhtStorablePacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(packet)) => {
                warn!("Store queue full, dropping relayed packet {}", packet.key());
                false
            }
            Err(mpsc::error::TrySendError::Closed(packet)) => {
                warn!("Store workers gone, dropping relayed packet {}", packet.key());
                false
            }
        }
    }

    /// Packets waiting for a worker
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::EncryptedEmailPacket;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct GatedStore {
        started: mpsc::UnboundedSender<DhtStorablePacket>,
        gate: Semaphore,
    }

    #[async_trait]
    impl PacketStore for GatedStore {
        async fn store_packet(&self, packet: DhtStorablePacket) -> Result<()> {
            self.started.send(packet).unwrap();
            self.gate.acquire().await.unwrap().forget();
            Ok(())
        }
    }

    fn packet(n: u8) -> DhtStorablePacket {
        EncryptedEmailPacket::new([n; 32], 1, vec![n; 16])
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn test_overflow_is_dropped() {
        let (started, mut started_rx) = mpsc::unbounded_channel();
        let store = Arc::new(GatedStore {
            started,
            gate: Semaphore::new(0),
        });
        let pool = StoreWorkerPool::spawn(store.clone(), 1, 1);

        let first = packet(1);
        assert!(pool.submit(first.clone()));
        // the only worker is now busy with the first packet
        let busy = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .unwrap();
        assert_eq!(busy, Some(first));

        let second = packet(2);
        assert!(pool.submit(second.clone()));
        assert_eq!(pool.pending(), 1);
        assert!(!pool.submit(packet(3)));

        store.gate.add_permits(2);
        let next = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .unwrap();
        assert_eq!(next, Some(second));
        assert_eq!(pool.pending(), 0);
    }
}
