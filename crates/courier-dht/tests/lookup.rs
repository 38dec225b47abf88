//! Closest-peer lookups against scripted peers on the in-memory network

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    CommunicationBody, CommunicationPacket, DhtKey, Hash256, PeerIdentity, PeerList,
    ResponsePacket, Timestamp,
};
use courier_dht::{ClosestPeersLookup, LookupParams, RoutingTable, K, S};
use courier_transport::{
    BanList, DatagramTransport, MemoryNetwork, PacketDispatcher, PacketListener, SendQueue,
};
use tokio::time::Instant;

/// Peer that answers every `FindClosePeers` with a fixed list, or never
/// answers when `reply` is `None`
struct ScriptedPeer {
    queue: Arc<SendQueue>,
    reply: Option<Vec<PeerIdentity>>,
    asked: AtomicUsize,
}

impl PacketListener for ScriptedPeer {
    fn packet_received(
        &self,
        packet: &CommunicationPacket,
        sender: &PeerIdentity,
        _received_at: Timestamp,
    ) {
        if !matches!(packet.body, CommunicationBody::FindClosePeers(_)) {
            return;
        }
        self.asked.fetch_add(1, Ordering::SeqCst);
        let Some(peers) = &self.reply else {
            return;
        };
        let response = CommunicationPacket::response_to(
            packet.packet_id,
            ResponsePacket::ok(PeerList::new(peers.clone())),
        );
        let queue = self.queue.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            let _ = queue.send(&response, &sender).await;
        });
    }
}

fn attach(
    network: &Arc<MemoryNetwork>,
    identity: &PeerIdentity,
) -> (Arc<SendQueue>, Arc<PacketDispatcher>) {
    let (transport, inbound) = network.join(identity.clone());
    let queue = Arc::new(SendQueue::new(transport as Arc<dyn DatagramTransport>));
    let dispatcher = Arc::new(PacketDispatcher::new(Arc::new(BanList::new())));
    dispatcher.add_listener(queue.clone());
    tokio::spawn(dispatcher.clone().run(inbound));
    (queue, dispatcher)
}

fn scripted(
    network: &Arc<MemoryNetwork>,
    identity: &PeerIdentity,
    reply: Option<Vec<PeerIdentity>>,
) -> Arc<ScriptedPeer> {
    let (queue, dispatcher) = attach(network, identity);
    let peer = Arc::new(ScriptedPeer {
        queue,
        reply,
        asked: AtomicUsize::new(0),
    });
    dispatcher.add_listener(peer.clone());
    peer
}

struct Searcher {
    table: Arc<RoutingTable>,
    queue: Arc<SendQueue>,
    bans: Arc<BanList>,
}

impl Searcher {
    fn start(network: &Arc<MemoryNetwork>, k: usize) -> Self {
        let identity = PeerIdentity::random();
        let (queue, _dispatcher) = attach(network, &identity);
        Self {
            table: Arc::new(RoutingTable::new(identity, k, S)),
            queue,
            bans: Arc::new(BanList::new()),
        }
    }

    fn knows(&self, peers: &[&PeerIdentity]) {
        for peer in peers {
            self.table.insert_or_refresh(peer, Timestamp::now());
        }
    }

    async fn lookup(&self, key: DhtKey, params: LookupParams) -> Vec<PeerIdentity> {
        ClosestPeersLookup::new(
            key,
            params,
            self.table.clone(),
            self.queue.clone(),
            self.bans.clone(),
        )
        .run()
        .await
    }
}

fn params(k: usize, alpha: usize) -> LookupParams {
    LookupParams {
        k,
        alpha,
        max_rounds: 20,
        response_timeout: Duration::from_millis(500),
        lookup_timeout: Duration::from_secs(10),
    }
}

fn asked(peers: &[Arc<ScriptedPeer>]) -> usize {
    peers.iter().map(|p| p.asked.load(Ordering::SeqCst)).sum()
}

#[test_log::test(tokio::test)]
async fn test_empty_table_finds_nothing() {
    let network = MemoryNetwork::new();
    let searcher = Searcher::start(&network, K);
    let found = searcher.lookup(Hash256::random(), params(K, 3)).await;
    assert!(found.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_silent_peer_left_out_and_backed_off() {
    let network = MemoryNetwork::new();
    let searcher = Searcher::start(&network, K);
    let talker = PeerIdentity::random();
    let mute = PeerIdentity::random();
    let _talker_peer = scripted(&network, &talker, Some(vec![]));
    let mute_peer = scripted(&network, &mute, None);
    searcher.knows(&[&talker, &mute]);

    let found = searcher.lookup(Hash256::random(), params(K, 3)).await;
    assert_eq!(found, vec![talker]);
    assert_eq!(mute_peer.asked.load(Ordering::SeqCst), 1);
    let backed_off = searcher.table.get(&mute).unwrap();
    assert_eq!(backed_off.consecutive_timeouts(), 1);
    assert!(backed_off.is_locked(Timestamp::now()));
}

#[test_log::test(tokio::test)]
async fn test_locked_peer_is_never_queried() {
    let network = MemoryNetwork::new();
    let searcher = Searcher::start(&network, K);
    let locked = PeerIdentity::random();
    let middle = PeerIdentity::random();
    let locked_peer = scripted(&network, &locked, Some(vec![]));
    let _middle_peer = scripted(&network, &middle, Some(vec![locked.clone()]));
    searcher.knows(&[&middle, &locked]);

    let now = Timestamp::now();
    for _ in 0..3 {
        searcher.table.get(&locked).unwrap().no_response(now);
    }

    let found = searcher.lookup(Hash256::random(), params(K, 3)).await;
    assert_eq!(found, vec![middle]);
    assert_eq!(locked_peer.asked.load(Ordering::SeqCst), 0);
    let still_locked = searcher.table.get(&locked).unwrap();
    assert!(still_locked.is_locked(Timestamp::now()));
    assert_eq!(still_locked.consecutive_timeouts(), 3);
}

#[test_log::test(tokio::test)]
async fn test_round_ceiling() {
    let network = MemoryNetwork::new();
    let searcher = Searcher::start(&network, K);
    let identities: Vec<PeerIdentity> = (0..5).map(|_| PeerIdentity::random()).collect();
    let peers: Vec<Arc<ScriptedPeer>> = identities
        .iter()
        .map(|id| scripted(&network, id, Some(identities.clone())))
        .collect();
    searcher.knows(&identities.iter().collect::<Vec<_>>());

    let key = Hash256::random();
    let mut one_round = params(K, 1);
    one_round.max_rounds = 1;
    let found = searcher.lookup(key, one_round).await;

    assert_eq!(asked(&peers), 1);
    let closest = identities
        .iter()
        .min_by_key(|id| key.distance(&id.id()))
        .cloned()
        .unwrap();
    assert_eq!(found, vec![closest]);
}

#[test_log::test(tokio::test)]
async fn test_time_ceiling() {
    let network = MemoryNetwork::new();
    let searcher = Searcher::start(&network, K);
    let mute = PeerIdentity::random();
    let _mute_peer = scripted(&network, &mute, None);
    searcher.knows(&[&mute]);

    let mut short = params(K, 3);
    short.response_timeout = Duration::from_secs(30);
    short.lookup_timeout = Duration::from_millis(300);

    let started = Instant::now();
    let found = searcher.lookup(Hash256::random(), short).await;
    assert!(found.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test_log::test(tokio::test)]
async fn test_stops_after_one_finishing_round() {
    let network = MemoryNetwork::new();
    let searcher = Searcher::start(&network, 2);
    let entry = PeerIdentity::random();
    let others: Vec<PeerIdentity> = (0..4).map(|_| PeerIdentity::random()).collect();
    let _entry_peer = scripted(&network, &entry, Some(others.clone()));
    let other_peers: Vec<Arc<ScriptedPeer>> = others
        .iter()
        .map(|id| scripted(&network, id, Some(vec![])))
        .collect();
    searcher.knows(&[&entry]);

    // nothing can be closer than the entry peer itself, so the first round
    // brings no improvement and the next one is the last
    let key = entry.id();
    let found = searcher.lookup(key, params(2, 1)).await;

    assert_eq!(asked(&other_peers), 1);
    let nearest_other = others
        .iter()
        .min_by_key(|id| key.distance(&id.id()))
        .cloned()
        .unwrap();
    assert_eq!(found, vec![entry, nearest_other]);
}
