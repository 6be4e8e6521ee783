//! Outbound data path to backends.
//!
//! Every registered backend owns a [`Forwarder`]: an opaque channel the
//! pipeline pushes raw intercepted packets into. The production forwarder
//! sends each packet as a single UDP datagram to the backend's data port;
//! the in-process [`ChannelForwarder`] delivers into a tokio channel.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound channel to a single backend.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Deliver one packet to the backend.
    async fn send_data(&self, data: &[u8]) -> io::Result<()>;

    /// Close the channel. Later sends fail.
    async fn close(&self) -> io::Result<()>;
}

/// Opens forwarders for newly registered backends.
#[async_trait]
pub trait ForwarderFactory: Send + Sync {
    async fn connect(&self, address: IpAddr) -> io::Result<Arc<dyn Forwarder>>;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "forwarder closed")
}

/// Forwarder sending each packet as a UDP datagram.
pub struct UdpForwarder {
    socket: UdpSocket,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl UdpForwarder {
    /// Bind an ephemeral local socket and connect it to `peer`.
    pub async fn connect(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;

        debug!(peer_addr = %peer, "UDP forwarder connected");

        Ok(Self {
            socket,
            peer,
            closed: AtomicBool::new(false),
        })
    }

    /// Address packets are sent to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Forwarder for UdpForwarder {
    async fn send_data(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        self.socket.send(data).await?;
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Creates [`UdpForwarder`]s targeting a fixed data port.
#[derive(Debug, Clone)]
pub struct UdpForwarderFactory {
    data_port: u16,
}

impl UdpForwarderFactory {
    pub fn new(data_port: u16) -> Self {
        Self { data_port }
    }
}

#[async_trait]
impl ForwarderFactory for UdpForwarderFactory {
    async fn connect(&self, address: IpAddr) -> io::Result<Arc<dyn Forwarder>> {
        let forwarder = UdpForwarder::connect(SocketAddr::new(address, self.data_port)).await?;
        Ok(Arc::new(forwarder))
    }
}

/// A packet handed to a [`ChannelForwarder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Data-plane address of the backend the packet was sent to.
    pub address: IpAddr,
    pub payload: Bytes,
}

/// In-process forwarder delivering into an unbounded channel.
pub struct ChannelForwarder {
    address: IpAddr,
    tx: mpsc::UnboundedSender<Delivery>,
    closed: AtomicBool,
}

#[async_trait]
impl Forwarder for ChannelForwarder {
    async fn send_data(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        self.tx
            .send(Delivery {
                address: self.address,
                payload: Bytes::copy_from_slice(data),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "delivery channel closed"))
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Creates [`ChannelForwarder`]s that all feed one receiver.
#[derive(Debug, Clone)]
pub struct ChannelForwarderFactory {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelForwarderFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ForwarderFactory for ChannelForwarderFactory {
    async fn connect(&self, address: IpAddr) -> io::Result<Arc<dyn Forwarder>> {
        Ok(Arc::new(ChannelForwarder {
            address,
            tx: self.tx.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}
