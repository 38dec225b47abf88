//! DHT facade: lookups, replicated store, retrieval and secure deletion
//!
//! [`KademliaDht`] answers requests from other peers as a
//! [`PacketListener`] and offers the client side operations. Every network
//! operation degrades to partial or empty results when peers do not answer;
//! only local failures (storage, encoding) surface as errors.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use courier_core::{
    CommunicationBody, CommunicationPacket, DataPacket, DeletionInfo, DeletionQuery, DhtKey,
    DhtStorablePacket, EmailDeleteRequest, FindClosePeers, IndexDeleteEntry, IndexDeleteRequest,
    PeerIdentity, PeerList, ResponsePacket, RetrieveRequest, StatusCode, StorableType,
    StoreRequest, Timestamp,
};
use courier_core::packet::MAX_INDEX_DELETE_ENTRIES;
use courier_crypto::{CryptoError, DeleteAuthorization, HashcashStamp};
use courier_transport::{BanList, PacketBatch, PacketDispatcher, PacketListener, SendQueue};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::lookup::{ClosestPeersLookup, LookupParams};
use crate::peer_file::PeerFile;
use crate::routing_table::{RoutingTable, RoutingTableStats};
use crate::storage::{DeleteRequest, PacketStorage, StoreOutcome};

/// Outcome of [`KademliaDht::store`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreReceipt {
    /// Key the packet is stored under
    pub key: DhtKey,
    /// Peers a store request was sent to
    pub peers_contacted: usize,
    /// Whether the local node keeps a replica
    pub stored_locally: bool,
}

/// DHT statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DhtStats {
    /// Routing table figures
    pub routing: RoutingTableStats,
    /// Peers currently banned
    pub banned_peers: usize,
}

/// Kademlia DHT node
#[derive(Clone)]
pub struct KademliaDht {
    inner: Arc<DhtInner>,
}

struct DhtInner {
    config: DhtConfig,
    table: Arc<RoutingTable>,
    queue: Arc<SendQueue>,
    bans: Arc<BanList>,
    storage: PacketStorage,
    peer_file: Option<PeerFile>,
}

impl KademliaDht {
    /// Create a DHT node using storage under `config.storage_path`
    pub fn new(config: DhtConfig, queue: Arc<SendQueue>, bans: Arc<BanList>) -> Result<Self> {
        config.validate().map_err(DhtError::Configuration)?;
        let storage = PacketStorage::open(config.storage_dir(), config.max_storage_bytes)?;
        Self::with_storage(config, queue, bans, storage)
    }

    /// Create a DHT node over already opened storage
    pub fn with_storage(
        config: DhtConfig,
        queue: Arc<SendQueue>,
        bans: Arc<BanList>,
        storage: PacketStorage,
    ) -> Result<Self> {
        config.validate().map_err(DhtError::Configuration)?;
        let local = queue.local_identity();
        let table = Arc::new(RoutingTable::new(
            local.clone(),
            config.k_bucket_size,
            config.sibling_bucket_size,
        ));

        let peer_file = config.peer_file.as_ref().map(PeerFile::new);
        if let Some(file) = &peer_file {
            let now = Timestamp::now();
            for peer in file.load()? {
                table.insert_or_refresh(&peer, now);
            }
        }

        info!(
            "DHT node {} started with {} known peers",
            local.id(),
            table.len()
        );

        Ok(Self {
            inner: Arc::new(DhtInner {
                config,
                table,
                queue,
                bans,
                storage,
                peer_file,
            }),
        })
    }

    /// Register this node as a listener on `dispatcher`
    pub fn register(&self, dispatcher: &PacketDispatcher) {
        dispatcher.add_listener(Arc::new(self.clone()));
    }

    /// Local node identity
    pub fn local_identity(&self) -> &PeerIdentity {
        self.inner.table.local_identity()
    }

    /// The routing table
    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.inner.table
    }

    /// Local packet storage
    pub fn storage(&self) -> &PacketStorage {
        &self.inner.storage
    }

    /// Configuration in use
    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Add `peers` to the routing table and look up the local id to
    /// populate the buckets around it. Returns the number of peers known
    /// afterwards.
    #[instrument(skip_all)]
    pub async fn bootstrap(&self, peers: &[PeerIdentity]) -> usize {
        let now = Timestamp::now();
        for peer in peers {
            if !self.inner.bans.is_banned(peer) {
                self.inner.table.insert_or_refresh(peer, now);
            }
        }
        let local_id = self.local_identity().id();
        let found = self.closest_peers(&local_id).await;
        info!(
            "Bootstrap reached {} peers, {} known",
            found.len(),
            self.inner.table.len()
        );
        self.inner.table.len()
    }

    /// Iterative lookup for the K peers closest to `key` that answered
    pub async fn closest_peers(&self, key: &DhtKey) -> Vec<PeerIdentity> {
        self.inner.lookup(*key).await
    }

    /// First valid packet of type `storable` under `key`, local storage
    /// first. `None` when nobody has it.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn find_one(
        &self,
        key: &DhtKey,
        storable: StorableType,
    ) -> Result<Option<DhtStorablePacket>> {
        if let Some(packet) = self.inner.retrieve_local(*key, storable).await? {
            trace!("Found {} locally", key);
            return Ok(Some(packet));
        }

        let peers = self.inner.lookup(*key).await;
        if peers.is_empty() {
            return Ok(None);
        }
        let batch = self.inner.request_batch(&peers, || RetrieveRequest {
            key: *key,
            data_type: storable,
        });
        let found = self
            .inner
            .first_match(&batch, |response| accept_packet(key, storable, response))
            .await;
        Ok(found)
    }

    /// All distinct valid packets of type `storable` under `key`, up to K,
    /// local replica included
    #[instrument(skip_all, fields(key = %key))]
    pub async fn find_all(
        &self,
        key: &DhtKey,
        storable: StorableType,
    ) -> Result<Vec<DhtStorablePacket>> {
        let limit = self.inner.config.k_bucket_size;
        let mut packets = Vec::new();
        if let Some(packet) = self.inner.retrieve_local(*key, storable).await? {
            packets.push(packet);
        }

        let peers = self.inner.lookup(*key).await;
        if !peers.is_empty() {
            let batch = self.inner.request_batch(&peers, || RetrieveRequest {
                key: *key,
                data_type: storable,
            });
            batch
                .await_all_responses(self.inner.config.response_timeout())
                .await;
            for (_, response) in batch.response_packets() {
                if let Some(packet) = accept_packet(key, storable, &response) {
                    if !packets.contains(&packet) {
                        packets.push(packet);
                    }
                }
            }
        }

        packets.truncate(limit);
        Ok(packets)
    }

    /// Store `packet` on the K closest peers, and locally when this node is
    /// one of them. Returns once the requests are handed to the transport;
    /// acknowledgements are not awaited.
    #[instrument(skip_all, fields(key = %packet.key()))]
    pub async fn store(&self, packet: DhtStorablePacket) -> Result<StoreReceipt> {
        let key = packet.key();
        let peers = self.inner.lookup(key).await;

        let resource = StoreRequest::resource_for(&key);
        let bits = self.inner.config.hashcash_bits;
        let stamp =
            tokio::task::spawn_blocking(move || HashcashStamp::mint(&resource, bits)).await?;
        let request = StoreRequest {
            stamp: stamp.to_string(),
            packet: packet.clone(),
        };
        // surface an oversized packet here instead of in the send tasks
        CommunicationPacket::new(request.clone()).encode()?;

        let stored_locally = if self.inner.is_among_closest(&key, &peers) {
            match self.inner.store_local(packet).await {
                Ok(outcome) => outcome != StoreOutcome::Rejected,
                Err(e) => {
                    warn!("Local replica of {} not stored: {}", key, e);
                    false
                }
            }
        } else {
            false
        };

        if !peers.is_empty() {
            let batch = self.inner.request_batch(&peers, || request.clone());
            batch.await_send_completion().await;
            self.inner.track_responses(batch);
        } else if !stored_locally {
            warn!("No peers available to store {}", key);
        }

        debug!("Store of {} sent to {} peers", key, peers.len());
        Ok(StoreReceipt {
            key,
            peers_contacted: peers.len(),
            stored_locally,
        })
    }

    /// Find the delete authorization for `key` whose hash is
    /// `verification_hash`. Tokens that do not hash to it are ignored.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn find_delete_authorization(
        &self,
        key: &DhtKey,
        verification_hash: &[u8; 32],
    ) -> Result<Option<DeleteAuthorization>> {
        let local = self.inner.local_deletion_records(*key).await?;
        if let Some(record) = local
            .into_iter()
            .find(|r| r.authorization.matches(verification_hash))
        {
            return Ok(Some(record.authorization));
        }

        let peers = self.inner.lookup(*key).await;
        if peers.is_empty() {
            return Ok(None);
        }
        let batch = self
            .inner
            .request_batch(&peers, || DeletionQuery { key: *key });
        let found = self
            .inner
            .first_match(&batch, |response| {
                let Some(DataPacket::DeletionInfo(info)) = &response.payload else {
                    return None;
                };
                info.records
                    .iter()
                    .find(|r| r.key == *key && r.authorization.matches(verification_hash))
                    .map(|r| r.authorization.clone())
            })
            .await;
        Ok(found)
    }

    /// Delete an email packet locally and on the closest peers. Returns the
    /// number of peers the request was sent to.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete_email_packet(
        &self,
        key: &DhtKey,
        authorization: DeleteAuthorization,
    ) -> Result<usize> {
        let request = EmailDeleteRequest {
            key: *key,
            authorization,
        };
        self.inner
            .delete_local(CommunicationBody::EmailDelete(request.clone()))
            .await?;

        let peers = self.inner.lookup(*key).await;
        if !peers.is_empty() {
            let batch = self.inner.request_batch(&peers, || request.clone());
            batch.await_send_completion().await;
            self.inner.track_responses(batch);
        }
        Ok(peers.len())
    }

    /// Delete entries from the index of `destination_hash` locally and on
    /// the closest peers. Returns the number of peers contacted.
    #[instrument(skip_all, fields(key = %destination_hash))]
    pub async fn delete_index_entries(
        &self,
        destination_hash: &DhtKey,
        entries: Vec<IndexDeleteEntry>,
    ) -> Result<usize> {
        let requests: Vec<IndexDeleteRequest> = entries
            .chunks(MAX_INDEX_DELETE_ENTRIES)
            .map(|chunk| IndexDeleteRequest {
                destination_hash: *destination_hash,
                entries: chunk.to_vec(),
            })
            .collect();
        for request in &requests {
            self.inner
                .delete_local(CommunicationBody::IndexDelete(request.clone()))
                .await?;
        }

        let peers = self.inner.lookup(*destination_hash).await;
        if !peers.is_empty() && !requests.is_empty() {
            let batch = Arc::new(PacketBatch::new());
            for peer in &peers {
                for request in &requests {
                    batch.put_packet(CommunicationPacket::new(request.clone()), peer.clone());
                }
            }
            self.inner.queue.send_batch(&batch);
            batch.await_send_completion().await;
            self.inner.track_responses(batch);
        }
        Ok(peers.len())
    }

    /// Look up a random id in every k-bucket not refreshed within the
    /// configured interval. Returns the number of buckets refreshed.
    pub async fn refresh_stale_buckets(&self) -> usize {
        let threshold = self.inner.config.bucket_refresh();
        let stale = self.inner.table.stale_buckets(threshold, Timestamp::now());
        for &index in &stale {
            let target = self.inner.table.refresh_target(index);
            self.inner.lookup(target).await;
            self.inner.table.mark_refreshed(index, Timestamp::now());
        }
        if !stale.is_empty() {
            debug!("Refreshed {} buckets", stale.len());
        }
        stale.len()
    }

    /// One maintenance pass: refresh stale buckets, purge expired packets
    /// and deletion records, save the peer file
    pub async fn maintenance_once(&self) -> Result<()> {
        self.refresh_stale_buckets().await;

        let storage = self.inner.storage.clone();
        let retention = self.inner.config.retention();
        let expired = tokio::task::spawn_blocking(move || {
            storage.delete_expired(retention, Timestamp::now())
        })
        .await??;
        if expired > 0 {
            info!("Purged {} expired packets", expired);
        }

        self.save_peers()
    }

    /// Write the routing table to the peer file, if one is configured
    pub fn save_peers(&self) -> Result<()> {
        let Some(file) = &self.inner.peer_file else {
            return Ok(());
        };
        let peers: Vec<PeerIdentity> = self
            .inner
            .table
            .all_peers()
            .iter()
            .map(|p| p.identity().clone())
            .collect();
        file.save(&peers)
    }

    /// Run [`maintenance_once`](Self::maintenance_once) on the configured
    /// interval until the handle is aborted
    pub fn run_maintenance(&self) -> JoinHandle<()> {
        let dht = self.clone();
        let period = self.inner.config.maintenance_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = dht.maintenance_once().await {
                    warn!("DHT maintenance failed: {}", e);
                }
            }
        })
    }

    /// Current statistics
    pub fn stats(&self) -> DhtStats {
        DhtStats {
            routing: self.inner.table.stats(Timestamp::now()),
            banned_peers: self.inner.bans.len(),
        }
    }
}

impl DhtInner {
    async fn lookup(&self, key: DhtKey) -> Vec<PeerIdentity> {
        ClosestPeersLookup::new(
            key,
            LookupParams::from(&self.config),
            self.table.clone(),
            self.queue.clone(),
            self.bans.clone(),
        )
        .run()
        .await
    }

    /// Whether the local node belongs to the K closest for `key`, given the
    /// closest peers found, closest first
    fn is_among_closest(&self, key: &DhtKey, peers: &[PeerIdentity]) -> bool {
        if peers.len() < self.config.k_bucket_size {
            return true;
        }
        let local = key.distance(&self.table.local_id());
        peers
            .last()
            .map(|farthest| local < key.distance(&farthest.id()))
            .unwrap_or(true)
    }

    /// Send one request built by `make` to every peer
    fn request_batch<B>(&self, peers: &[PeerIdentity], make: impl Fn() -> B) -> Arc<PacketBatch>
    where
        B: Into<CommunicationBody>,
    {
        let batch = Arc::new(PacketBatch::new());
        for peer in peers {
            batch.put_packet(CommunicationPacket::new(make()), peer.clone());
        }
        self.queue.send_batch(&batch);
        batch
    }

    /// Wait for responses until `accept` returns something, every peer
    /// answered or the response timeout passed
    async fn first_match<T>(
        &self,
        batch: &PacketBatch,
        accept: impl Fn(&ResponsePacket) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + self.config.response_timeout();
        let expected = batch.destinations().len();
        let mut checked = HashSet::new();

        loop {
            for (sender, response) in batch.response_packets() {
                if !checked.insert(sender) {
                    continue;
                }
                if let Some(found) = accept(&response) {
                    return Some(found);
                }
            }

            let seen = checked.len();
            let now = Instant::now();
            if seen >= expected || now >= deadline {
                return None;
            }
            if !batch.await_responses(seen + 1, deadline - now).await {
                // one last pass over anything that raced the timeout
                return batch
                    .response_packets()
                    .into_iter()
                    .filter(|(sender, _)| !checked.contains(sender))
                    .find_map(|(_, response)| accept(&response));
            }
        }
    }

    /// Update peer liveness from the responses to `batch` in the background
    fn track_responses(&self, batch: Arc<PacketBatch>) {
        let table = self.table.clone();
        let wait = self.config.response_timeout();
        tokio::spawn(async move {
            batch.await_all_responses(wait).await;
            let responses = batch.response_packets();
            let now = Timestamp::now();
            for destination in batch.destinations() {
                let Some(peer) = table.get(&destination) else {
                    continue;
                };
                match responses.iter().find(|(sender, _)| sender == &destination) {
                    Some((_, response)) => {
                        peer.response_received(now);
                        if response.status != StatusCode::Ok {
                            debug!("{} answered {:?}", destination, response.status);
                        }
                    }
                    None => peer.no_response(now),
                }
            }
        });
    }

    async fn retrieve_local(
        &self,
        key: DhtKey,
        storable: StorableType,
    ) -> Result<Option<DhtStorablePacket>> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.retrieve(&key, storable)).await?
    }

    async fn store_local(&self, packet: DhtStorablePacket) -> Result<StoreOutcome> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.store(&packet)).await?
    }

    async fn local_deletion_records(
        &self,
        key: DhtKey,
    ) -> Result<Vec<courier_core::DeletionRecord>> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.deletion_records(&key)).await?
    }

    /// Apply an email or index delete request to local storage
    async fn delete_local(&self, body: CommunicationBody) -> Result<bool> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || match &body {
            CommunicationBody::EmailDelete(r) => storage.process_delete(DeleteRequest::Email(r)),
            CommunicationBody::IndexDelete(r) => storage.process_delete(DeleteRequest::Index(r)),
            _ => Ok(false),
        })
        .await?
    }

    /// Build the answer to an incoming request; `None` for packets that are
    /// not requests to the DHT
    async fn answer(&self, packet: &CommunicationPacket, sender: &PeerIdentity) -> Option<ResponsePacket> {
        let response = match &packet.body {
            CommunicationBody::FindClosePeers(FindClosePeers { key }) => {
                let peers: Vec<PeerIdentity> = self
                    .table
                    .get_closest(key, self.config.k_bucket_size + 1, Timestamp::now())
                    .iter()
                    .map(|p| p.identity().clone())
                    .filter(|p| p != sender)
                    .take(self.config.k_bucket_size)
                    .collect();
                ResponsePacket::ok(PeerList::new(peers))
            }
            CommunicationBody::Retrieve(request) => {
                match self.retrieve_local(request.key, request.data_type).await {
                    Ok(Some(found)) => ResponsePacket::ok(found),
                    Ok(None) => ResponsePacket::status(StatusCode::NoDataFound),
                    Err(e) => {
                        warn!("Retrieve of {} failed: {}", request.key, e);
                        ResponsePacket::status(StatusCode::GeneralError)
                    }
                }
            }
            CommunicationBody::Store(request) => {
                ResponsePacket::status(self.handle_store(request).await)
            }
            CommunicationBody::DeletionQuery(DeletionQuery { key }) => {
                match self.local_deletion_records(*key).await {
                    Ok(records) if !records.is_empty() => {
                        ResponsePacket::ok(DeletionInfo::new(records))
                    }
                    Ok(_) => ResponsePacket::status(StatusCode::NoDataFound),
                    Err(e) => {
                        warn!("Deletion query for {} failed: {}", key, e);
                        ResponsePacket::status(StatusCode::GeneralError)
                    }
                }
            }
            CommunicationBody::EmailDelete(_) | CommunicationBody::IndexDelete(_) => {
                // the answer never reveals whether anything was deleted
                if let Err(e) = self.delete_local(packet.body.clone()).await {
                    warn!("Delete request from {} failed: {}", sender, e);
                }
                ResponsePacket::status(StatusCode::Ok)
            }
            CommunicationBody::Response(_) | CommunicationBody::Relay(_) => return None,
        };
        Some(response)
    }

    async fn handle_store(&self, request: &StoreRequest) -> StatusCode {
        let stamp = match HashcashStamp::from_str(&request.stamp) {
            Ok(stamp) => stamp,
            Err(_) => return StatusCode::InvalidHashcash,
        };
        let checked = stamp.verify(
            &request.resource(),
            self.config.hashcash_bits,
            Utc::now().date_naive(),
            self.config.hashcash_validity_days,
        );
        match checked {
            Ok(()) => {}
            Err(CryptoError::InsufficientWork { .. }) => return StatusCode::InsufficientHashcash,
            Err(e) => {
                debug!("Rejecting store stamp: {}", e);
                return StatusCode::InvalidHashcash;
            }
        }

        match self.store_local(request.packet.clone()).await {
            Ok(StoreOutcome::Stored) | Ok(StoreOutcome::Duplicate) => StatusCode::Ok,
            Ok(StoreOutcome::Rejected) => StatusCode::InvalidPacket,
            Err(DhtError::StorageFull { .. }) => StatusCode::NoDiskSpace,
            Err(e) => {
                warn!("Store of {} failed: {}", request.packet.key(), e);
                StatusCode::GeneralError
            }
        }
    }
}

impl PacketListener for KademliaDht {
    fn packet_received(
        &self,
        packet: &CommunicationPacket,
        sender: &PeerIdentity,
        received_at: Timestamp,
    ) {
        if sender == self.local_identity() {
            return;
        }
        self.inner.table.insert_or_refresh(sender, received_at);

        if matches!(
            packet.body,
            CommunicationBody::Response(_) | CommunicationBody::Relay(_)
        ) {
            return;
        }

        let inner = self.inner.clone();
        let packet = packet.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            let Some(response) = inner.answer(&packet, &sender).await else {
                return;
            };
            let reply = CommunicationPacket::response_to(packet.packet_id, response);
            if let Err(e) = inner.queue.send(&reply, &sender).await {
                debug!("Could not answer {} from {}: {}", packet.body.kind(), sender, e);
            }
        });
    }
}

/// The storable packet in `response` if it is of type `storable`, carries
/// `key` and verifies
fn accept_packet(
    key: &DhtKey,
    storable: StorableType,
    response: &ResponsePacket,
) -> Option<DhtStorablePacket> {
    if response.status != StatusCode::Ok {
        return None;
    }
    let Some(DataPacket::Storable(packet)) = &response.payload else {
        return None;
    };
    if packet.key() != *key || packet.storable_type() != storable {
        debug!("Discarding packet with mismatched key or type for {}", key);
        return None;
    }
    if let DhtStorablePacket::DirectoryEntry(entry) = packet {
        if !entry.verify() {
            debug!("Discarding directory entry with bad signature for {}", key);
            return None;
        }
    }
    Some(packet.clone())
}
