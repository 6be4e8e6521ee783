//! Packet forwarding pipeline.
//!
//! ## Architecture
//!
//! ```text
//! interceptor --submit/offer--> [bounded queue] --> worker 1..N
//!                                                     |
//!                                       flow key -> registry.get -> forwarder
//! ```
//!
//! Workers share a single receiver. Packets are forwarded as-is; the
//! pipeline never rewrites them and never retries a failed send.
//!
//! ## Usage
//!
//! ```ignore
//! let (pipeline, sender) = PacketPipeline::start(PipelineConfig::default(), registry);
//! let verdict = sender.submit(packet).await;
//! // ...
//! pipeline.shutdown(Duration::from_secs(2)).await;
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::packet::flow_key;
use crate::registry::BackendRegistry;
use crate::session::shutdown_signalled;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 20;

/// Default queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Pipeline sizing.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Packets buffered between the interceptor and the workers.
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Verdict handed back to the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The balancer took ownership of the packet.
    Drop,
    /// The pipeline is gone; let the packet continue on its original path.
    Accept,
}

/// Data-plane counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Packets enqueued.
    pub received: AtomicU64,
    /// Packets handed to a forwarder.
    pub forwarded: AtomicU64,
    /// Packets without a parseable flow key.
    pub malformed: AtomicU64,
    /// Packets dropped because no backend was registered.
    pub unroutable: AtomicU64,
    /// Forwarder send errors.
    pub send_failures: AtomicU64,
    /// Packets refused by `offer` because the queue was full.
    pub queue_overflows: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub malformed: u64,
    pub unroutable: u64,
    pub send_failures: u64,
    pub queue_overflows: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
        }
    }
}

/// Submission handle given to the interceptor.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<Bytes>,
    stats: Arc<PipelineStats>,
}

impl PacketSender {
    fn bounded(depth: usize, stats: Arc<PipelineStats>) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx, stats }, rx)
    }

    /// Enqueue a packet, waiting for queue space.
    pub async fn submit(&self, packet: Bytes) -> Verdict {
        match self.tx.send(packet).await {
            Ok(()) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
            Err(_) => Verdict::Accept,
        }
    }

    /// Enqueue a packet without waiting. A full queue drops the packet.
    pub fn offer(&self, packet: Bytes) -> Verdict {
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
            Err(TrySendError::Full(_)) => {
                self.stats.queue_overflows.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
            Err(TrySendError::Closed(_)) => Verdict::Accept,
        }
    }

    /// Check if the pipeline stopped taking packets.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Worker pool forwarding intercepted packets to backends.
pub struct PacketPipeline {
    stop: watch::Sender<bool>,
    workers: JoinSet<()>,
    stats: Arc<PipelineStats>,
}

impl PacketPipeline {
    /// Spawn the workers. Must be called from within a tokio runtime.
    pub fn start(config: PipelineConfig, registry: Arc<BackendRegistry>) -> (Self, PacketSender) {
        let stats = Arc::new(PipelineStats::default());
        let (sender, rx) = PacketSender::bounded(config.queue_depth, Arc::clone(&stats));
        let rx = Arc::new(Mutex::new(rx));
        let (stop, stop_rx) = watch::channel(false);

        let workers_count = config.workers.max(1);
        let mut workers = JoinSet::new();
        for id in 0..workers_count {
            workers.spawn(worker(
                id,
                Arc::clone(&rx),
                Arc::clone(&registry),
                Arc::clone(&stats),
                stop_rx.clone(),
            ));
        }

        info!(
            workers = workers_count,
            queue_depth = config.queue_depth,
            "Packet pipeline started"
        );

        (
            Self {
                stop,
                workers,
                stats,
            },
            sender,
        )
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Stop accepting packets and drain the queue.
    ///
    /// Workers still busy after `grace` are aborted. Returns `true` if the
    /// queue drained in time.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let _ = self.stop.send(true);

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Pipeline worker failed");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = self.workers.len(),
                "Pipeline did not drain within grace period, aborting workers"
            );
            self.workers.shutdown().await;
        }

        info!(stats = ?self.stats.snapshot(), "Packet pipeline stopped");
        drained
    }
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    registry: Arc<BackendRegistry>,
    stats: Arc<PipelineStats>,
    mut stop: watch::Receiver<bool>,
) {
    let mut key = String::with_capacity(64);
    let mut stopping = false;

    loop {
        // Dequeueing is serialized: one worker waits on the receiver while
        // the rest wait on the lock. Only forwarding runs in parallel.
        let packet = {
            let mut queue = queue.lock().await;
            tokio::select! {
                packet = queue.recv() => packet,
                _ = shutdown_signalled(&mut stop), if !stopping => {
                    // refuse new packets, keep draining what is queued
                    stopping = true;
                    queue.close();
                    continue;
                }
            }
        };

        let Some(packet) = packet else {
            break;
        };

        forward_packet(&packet, &registry, &stats, &mut key).await;
    }

    trace!(worker = id, "Pipeline worker exiting");
}

async fn forward_packet(
    packet: &Bytes,
    registry: &BackendRegistry,
    stats: &PipelineStats,
    key: &mut String,
) {
    let flow = match flow_key(packet) {
        Ok(flow) => flow,
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            trace!(error = %e, len = packet.len(), "Dropping unparseable packet");
            return;
        }
    };

    key.clear();
    let _ = write!(key, "{}", flow);

    let backend = match registry.get(key) {
        Ok(backend) => backend,
        Err(_) => {
            stats.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(flow = %flow, "No backend for flow, dropping packet");
            return;
        }
    };

    match backend.forwarder().send_data(packet).await {
        Ok(()) => {
            stats.forwarded.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                backend = %backend.name(),
                flow = %flow,
                error = %e,
                "Failed to forward packet"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::ChannelForwarderFactory;
    use crate::packet::tests::udp_packet;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_forwards_to_flow_owner_unmodified() {
        let (factory, mut deliveries) = ChannelForwarderFactory::new();
        let registry = Arc::new(BackendRegistry::new(53, Arc::new(factory)).unwrap());
        registry.add("b1", ip("10.0.0.2")).await.unwrap();
        registry.add("b2", ip("10.0.0.3")).await.unwrap();

        let (pipeline, sender) =
            PacketPipeline::start(PipelineConfig::default(), Arc::clone(&registry));

        for port in 1000..1020u16 {
            let packet = Bytes::from(udp_packet([192, 0, 2, 10], port));
            assert_eq!(sender.submit(packet.clone()).await, Verdict::Drop);

            let delivery = deliveries.recv().await.unwrap();
            assert_eq!(delivery.payload, packet);

            let owner = registry.get(&format!("192.0.2.10:{}", port)).unwrap();
            assert_eq!(delivery.address, owner.address());
        }

        assert!(pipeline.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_malformed_and_unroutable_are_counted() {
        let (factory, _deliveries) = ChannelForwarderFactory::new();
        let registry = Arc::new(BackendRegistry::new(53, Arc::new(factory)).unwrap());

        let (pipeline, sender) = PacketPipeline::start(PipelineConfig::default(), registry);
        let stats = pipeline.stats();

        sender.submit(Bytes::from_static(b"not a packet")).await;
        sender
            .submit(Bytes::from(udp_packet([192, 0, 2, 10], 4000)))
            .await;

        eventually(|| {
            let s = stats.snapshot();
            s.malformed == 1 && s.unroutable == 1
        })
        .await;
        assert_eq!(stats.snapshot().forwarded, 0);

        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_send_failure_is_counted() {
        let (factory, deliveries) = ChannelForwarderFactory::new();
        let registry = Arc::new(BackendRegistry::new(53, Arc::new(factory)).unwrap());
        registry.add("b1", ip("10.0.0.2")).await.unwrap();
        drop(deliveries);

        let (pipeline, sender) = PacketPipeline::start(PipelineConfig::default(), registry);
        let stats = pipeline.stats();
        sender
            .submit(Bytes::from(udp_packet([192, 0, 2, 10], 4000)))
            .await;

        eventually(|| stats.snapshot().send_failures == 1).await;
        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_offer_overflow() {
        let stats = Arc::new(PipelineStats::default());
        let (sender, rx) = PacketSender::bounded(1, Arc::clone(&stats));

        assert_eq!(sender.offer(Bytes::from_static(b"a")), Verdict::Drop);
        assert_eq!(sender.offer(Bytes::from_static(b"b")), Verdict::Drop);
        assert_eq!(stats.snapshot().received, 1);
        assert_eq!(stats.snapshot().queue_overflows, 1);

        drop(rx);
        assert_eq!(sender.offer(Bytes::from_static(b"c")), Verdict::Accept);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_then_accepts() {
        let (factory, mut deliveries) = ChannelForwarderFactory::new();
        let registry = Arc::new(BackendRegistry::new(53, Arc::new(factory)).unwrap());
        registry.add("b1", ip("10.0.0.2")).await.unwrap();

        let config = PipelineConfig {
            workers: 2,
            queue_depth: 16,
        };
        let (pipeline, sender) = PacketPipeline::start(config, registry);
        let stats = pipeline.stats();

        for port in 0..5u16 {
            sender
                .submit(Bytes::from(udp_packet([192, 0, 2, 10], port)))
                .await;
        }

        assert!(pipeline.shutdown(Duration::from_secs(1)).await);
        assert_eq!(stats.snapshot().forwarded, 5);
        for _ in 0..5 {
            assert!(deliveries.try_recv().is_ok());
        }

        assert!(sender.is_closed());
        assert_eq!(
            sender
                .submit(Bytes::from(udp_packet([192, 0, 2, 10], 9)))
                .await,
            Verdict::Accept
        );
    }
}
