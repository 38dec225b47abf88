//! Relay handling between nodes on the in-memory network

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    CommunicationPacket, DhtStorablePacket, EncryptedEmailPacket, PeerIdentity, RelayRequest,
    StatusCode, StoreRequest,
};
use courier_crypto::HashcashStamp;
use courier_relay::{
    PacketStore, RelayConfig, RelayPacketHandler, RelayQueue, RelaySender, Result,
};
use courier_transport::{
    BanList, DatagramTransport, MemoryNetwork, PacketBatch, PacketDispatcher, SendQueue,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

const STAMP_BITS: u32 = 4;

struct ChannelStore(mpsc::UnboundedSender<DhtStorablePacket>);

#[async_trait]
impl PacketStore for ChannelStore {
    async fn store_packet(&self, packet: DhtStorablePacket) -> Result<()> {
        let _ = self.0.send(packet);
        Ok(())
    }
}

struct TestNode {
    identity: PeerIdentity,
    send_queue: Arc<SendQueue>,
    handler: RelayPacketHandler,
    config: RelayConfig,
    stored: mpsc::UnboundedReceiver<DhtStorablePacket>,
    _dir: TempDir,
}

fn start_node(network: &Arc<MemoryNetwork>) -> TestNode {
    let identity = PeerIdentity::random();
    let (transport, inbound) = network.join(identity.clone());
    let send_queue = Arc::new(SendQueue::new(transport as Arc<dyn DatagramTransport>));
    let dispatcher = Arc::new(PacketDispatcher::new(Arc::new(BanList::new())));
    dispatcher.add_listener(send_queue.clone());

    let dir = tempfile::tempdir().unwrap();
    let mut config = RelayConfig::with_queue_path(dir.path().to_string_lossy());
    config.hashcash_bits = STAMP_BITS;
    config.send_timeout_secs = 2;

    let (tx, stored) = mpsc::unbounded_channel();
    let handler = RelayPacketHandler::new(
        config.clone(),
        RelayQueue::open(config.queue_dir()).unwrap(),
        send_queue.clone(),
        Arc::new(ChannelStore(tx)),
    )
    .unwrap();
    handler.register(&dispatcher);
    tokio::spawn(dispatcher.run(inbound));

    TestNode {
        identity,
        send_queue,
        handler,
        config,
        stored,
        _dir: dir,
    }
}

fn relay(payload: Bytes, next_hop: Option<PeerIdentity>) -> RelayRequest {
    RelayRequest {
        stamp: HashcashStamp::mint(&RelayRequest::resource_for(&payload), STAMP_BITS).to_string(),
        delay_millis: 0,
        next_hop,
        payload,
    }
}

fn store_request(packet: &DhtStorablePacket) -> Bytes {
    let resource = StoreRequest::resource_for(&packet.key());
    CommunicationPacket::new(StoreRequest {
        stamp: HashcashStamp::mint(&resource, STAMP_BITS).to_string(),
        packet: packet.clone(),
    })
    .encode()
    .unwrap()
}

fn email_packet() -> DhtStorablePacket {
    EncryptedEmailPacket::new([7; 32], 1, b"relayed ciphertext".to_vec())
        .unwrap()
        .into()
}

/// Send `request` from `from` to `to` and return the status of the answer
async fn send_relay(from: &TestNode, to: &TestNode, request: RelayRequest) -> StatusCode {
    let batch = Arc::new(PacketBatch::new());
    batch.put_packet(CommunicationPacket::new(request), to.identity.clone());
    from.send_queue.send_batch(&batch);
    assert!(batch.await_first_reply(Duration::from_secs(5)).await);
    batch.response_packets().remove(0).1.status
}

async fn wait_for_queue(node: &TestNode, len: usize) {
    for _ in 0..50 {
        if node.handler.queue().len().unwrap() == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("relay queue never reached {} entries", len);
}

#[test_log::test(tokio::test)]
async fn test_relayed_store_is_submitted() {
    let network = MemoryNetwork::new();
    let client = start_node(&network);
    let mut relay_node = start_node(&network);

    let packet = email_packet();
    let status = send_relay(&client, &relay_node, relay(store_request(&packet), None)).await;
    assert_eq!(status, StatusCode::Ok);

    let stored = tokio::time::timeout(Duration::from_secs(5), relay_node.stored.recv())
        .await
        .unwrap();
    assert_eq!(stored, Some(packet));
}

#[test_log::test(tokio::test)]
async fn test_nested_relay_is_queued_then_forwarded() {
    let network = MemoryNetwork::new();
    let client = start_node(&network);
    let first_hop = start_node(&network);
    let mut last_hop = start_node(&network);

    let packet = email_packet();
    let inner = relay(store_request(&packet), None);
    let outer = relay(
        CommunicationPacket::new(inner).encode().unwrap(),
        Some(last_hop.identity.clone()),
    );
    assert_eq!(send_relay(&client, &first_hop, outer).await, StatusCode::Ok);
    wait_for_queue(&first_hop, 1).await;

    let sender = RelaySender::new(
        first_hop.handler.queue().clone(),
        first_hop.send_queue.clone(),
        first_hop.config.clone(),
    );
    assert_eq!(sender.send_due().await.unwrap(), 1);
    assert!(first_hop.handler.queue().is_empty().unwrap());

    let stored = tokio::time::timeout(Duration::from_secs(5), last_hop.stored.recv())
        .await
        .unwrap();
    assert_eq!(stored, Some(packet));
}

#[test_log::test(tokio::test)]
async fn test_unanswered_forward_stays_queued() {
    let network = MemoryNetwork::new();
    let client = start_node(&network);
    let first_hop = start_node(&network);
    let last_hop = start_node(&network);
    network.set_online(&last_hop.identity, false);

    let inner = relay(store_request(&email_packet()), None);
    let outer = relay(
        CommunicationPacket::new(inner).encode().unwrap(),
        Some(last_hop.identity.clone()),
    );
    assert_eq!(send_relay(&client, &first_hop, outer).await, StatusCode::Ok);
    wait_for_queue(&first_hop, 1).await;

    let sender = RelaySender::new(
        first_hop.handler.queue().clone(),
        first_hop.send_queue.clone(),
        first_hop.config.clone(),
    );
    assert_eq!(sender.send_due().await.unwrap(), 0);
    assert_eq!(first_hop.handler.queue().len().unwrap(), 1);
}

#[test_log::test(tokio::test)]
async fn test_bad_requests_answered_with_status() {
    let network = MemoryNetwork::new();
    let client = start_node(&network);
    let relay_node = start_node(&network);

    let mut bad_stamp = relay(store_request(&email_packet()), None);
    bad_stamp.stamp = "1:4:bogus".to_string();
    assert_eq!(
        send_relay(&client, &relay_node, bad_stamp).await,
        StatusCode::InvalidHashcash
    );

    let payload = store_request(&email_packet());
    let cheap = RelayRequest {
        stamp: HashcashStamp::mint(&RelayRequest::resource_for(&payload), 1).to_string(),
        delay_millis: 0,
        next_hop: None,
        payload,
    };
    assert_eq!(
        send_relay(&client, &relay_node, cheap).await,
        StatusCode::InsufficientHashcash
    );

    let garbage = relay(Bytes::from_static(b"definitely not a packet"), None);
    assert_eq!(
        send_relay(&client, &relay_node, garbage).await,
        StatusCode::InvalidPacket
    );

    // nested relay with no next hop is accepted but never queued
    let inner = relay(store_request(&email_packet()), None);
    let hopless = relay(CommunicationPacket::new(inner).encode().unwrap(), None);
    assert_eq!(
        send_relay(&client, &relay_node, hopless).await,
        StatusCode::Ok
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay_node.handler.queue().is_empty().unwrap());
}
