//! Packet interception seam.
//!
//! An [`Interceptor`] captures traffic for the VIP and hands each raw IP
//! packet to the pipeline through a [`PacketSender`]. Kernel-level capture
//! lives outside this crate; two implementations ship here:
//!
//! - [`NoopInterceptor`] captures nothing. Useful when only the control
//!   plane is exercised.
//! - [`UdpTapInterceptor`] receives mirrored IP packets, one per UDP
//!   datagram, and submits them unchanged.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pipeline::{PacketSender, Verdict};
use crate::session::shutdown_signalled;

/// Largest datagram the tap accepts.
const MAX_DATAGRAM: usize = 65_535;

/// Source of intercepted packets.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Feed packets into `sink` until `shutdown` is signalled or the
    /// pipeline stops taking packets.
    async fn run(
        &self,
        sink: PacketSender,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;

    /// Release the VIP and any capture hooks.
    async fn release(&self) -> anyhow::Result<()>;
}

/// Interceptor that captures nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInterceptor;

#[async_trait]
impl Interceptor for NoopInterceptor {
    async fn run(
        &self,
        _sink: PacketSender,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        shutdown_signalled(&mut shutdown).await;
        Ok(())
    }

    async fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Interceptor reading mirrored packets from a UDP socket.
#[derive(Debug)]
pub struct UdpTapInterceptor {
    socket: UdpSocket,
}

impl UdpTapInterceptor {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(tap_addr = %socket.local_addr()?, "Packet tap bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Interceptor for UdpTapInterceptor {
    async fn run(
        &self,
        sink: PacketSender,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, peer) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Tap receive error");
                    continue;
                }
            };

            if sink.submit(Bytes::copy_from_slice(&buf[..len])).await == Verdict::Accept {
                debug!(peer_addr = %peer, "Pipeline closed, stopping tap");
                break;
            }
        }

        Ok(())
    }

    async fn release(&self) -> anyhow::Result<()> {
        debug!("Packet tap released");
        Ok(())
    }
}
