//! Plain UDP transport for development networks
//!
//! Offers no anonymity: a peer identity is the UTF-8 socket address string
//! the peer is reachable at.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{PeerIdentity, Timestamp, MAX_DATAGRAM_SIZE};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::transport::{DatagramTransport, InboundDatagram};
use crate::INBOUND_CHANNEL_CAPACITY;

/// UDP socket transport
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    identity: PeerIdentity,
}

impl UdpTransport {
    /// Bind to `addr` and start the receive loop.
    ///
    /// `advertised` is the address other peers should use; it defaults to
    /// the bound address.
    pub async fn bind(
        addr: SocketAddr,
        advertised: Option<SocketAddr>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundDatagram>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = advertised.unwrap_or(socket.local_addr()?);
        let identity = Self::identity_for(&local)?;
        info!("UDP transport bound to {} as {}", socket.local_addr()?, local);

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        tokio::spawn(Self::receive_loop(socket.clone(), tx));

        Ok((Arc::new(Self { socket, identity }), rx))
    }

    /// Identity for a socket address
    pub fn identity_for(addr: &SocketAddr) -> Result<PeerIdentity> {
        PeerIdentity::new(addr.to_string().into_bytes())
            .map_err(|e| TransportError::InvalidDestination(e.to_string()))
    }

    fn address_of(identity: &PeerIdentity) -> Result<SocketAddr> {
        std::str::from_utf8(identity.as_bytes())
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::InvalidDestination(identity.to_string()))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, inbound: mpsc::Sender<InboundDatagram>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    continue;
                }
            };
            if len > MAX_DATAGRAM_SIZE {
                debug!("Dropping oversized datagram from {}", from);
                continue;
            }
            let sender = match Self::identity_for(&from) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let datagram = InboundDatagram {
                sender,
                bytes: Bytes::copy_from_slice(&buf[..len]),
                received_at: Timestamp::now(),
            };
            if inbound.send(datagram).await.is_err() {
                debug!("Inbound channel closed, stopping UDP receive loop");
                return;
            }
        }
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_datagram(&self, destination: &PeerIdentity, datagram: Bytes) -> Result<()> {
        let addr = Self::address_of(destination)?;
        self.socket.send_to(&datagram, addr).await?;
        Ok(())
    }

    fn local_identity(&self) -> PeerIdentity {
        self.identity.clone()
    }
}
