//! In-process datagram link for simulations and tests.
//!
//! [`MemoryTransport::pair`] connects two endpoints through unbounded
//! channels. Link conditions (random loss, latency, targeted drops) are set
//! per direction on the sending side, and every transmission attempt is
//! logged with its timestamp so timing behaviour can be asserted under
//! tokio's paused clock.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use super::Transport;

type Datagram = (Bytes, SocketAddr);

/// Predicate deciding whether an outgoing datagram is dropped
pub type DropFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// One transmission attempt as seen by the sending side
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub at: Instant,
    pub to: SocketAddr,
    pub bytes: Bytes,
    pub dropped: bool,
}

struct LinkConditions {
    loss_rate: f64,
    rng: StdRng,
    latency: Duration,
    drop_filter: Option<DropFilter>,
}

impl LinkConditions {
    fn should_drop(&mut self, buf: &[u8]) -> bool {
        if let Some(filter) = &self.drop_filter {
            if filter(buf) {
                return true;
            }
        }
        self.loss_rate > 0.0 && self.rng.gen_bool(self.loss_rate)
    }
}

pub struct MemoryTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    to_peer: mpsc::UnboundedSender<Datagram>,
    to_self: mpsc::UnboundedSender<Datagram>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    conditions: Mutex<LinkConditions>,
    sent: Mutex<Vec<SentDatagram>>,
}

impl MemoryTransport {
    /// Create two transports wired to each other
    pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (MemoryTransport, MemoryTransport) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self::new(addr_a, addr_b, tx_b.clone(), tx_a.clone(), rx_a);
        let b = Self::new(addr_b, addr_a, tx_a, tx_b, rx_b);
        (a, b)
    }

    fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        to_peer: mpsc::UnboundedSender<Datagram>,
        to_self: mpsc::UnboundedSender<Datagram>,
        inbound: mpsc::UnboundedReceiver<Datagram>,
    ) -> Self {
        Self {
            local_addr,
            peer_addr,
            to_peer,
            to_self,
            inbound: tokio::sync::Mutex::new(inbound),
            conditions: Mutex::new(LinkConditions {
                loss_rate: 0.0,
                rng: StdRng::seed_from_u64(0),
                latency: Duration::ZERO,
                drop_filter: None,
            }),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Drop outgoing datagrams at random with probability `loss_rate`
    pub fn set_loss(&self, loss_rate: f64, seed: u64) {
        let mut conditions = lock(&self.conditions);
        conditions.loss_rate = loss_rate.clamp(0.0, 1.0);
        conditions.rng = StdRng::seed_from_u64(seed);
    }

    /// Delay delivery of outgoing datagrams
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.conditions).latency = latency;
    }

    /// Drop every outgoing datagram for which `filter` returns true
    pub fn set_drop_filter(&self, filter: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        lock(&self.conditions).drop_filter = Some(Arc::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        lock(&self.conditions).drop_filter = None;
    }

    /// Deliver `bytes` to this transport as if `from` had sent it
    pub fn inject(&self, bytes: impl Into<Bytes>, from: SocketAddr) {
        let _ = self.to_self.send((bytes.into(), from));
    }

    /// Every transmission attempt so far, including dropped ones
    pub fn sent(&self) -> Vec<SentDatagram> {
        lock(&self.sent).clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

// datagram semantics: excess bytes are truncated
fn copy_datagram((bytes, from): Datagram, buf: &mut [u8]) -> (usize, SocketAddr) {
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
    (len, from)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let bytes = Bytes::copy_from_slice(buf);
        let (dropped, latency) = {
            let mut conditions = lock(&self.conditions);
            let dropped = target != self.peer_addr || conditions.should_drop(buf);
            (dropped, conditions.latency)
        };

        lock(&self.sent).push(SentDatagram {
            at: Instant::now(),
            to: target,
            bytes: bytes.clone(),
            dropped,
        });

        if dropped {
            trace!("link {} -> {} dropped {} bytes", self.local_addr, target, buf.len());
            return Ok(buf.len());
        }

        let datagram = (bytes, self.local_addr);
        if latency.is_zero() {
            let _ = self.to_peer.send(datagram);
        } else {
            let to_peer = self.to_peer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = to_peer.send(datagram);
            });
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbound = self.inbound.lock().await;
        let datagram = inbound
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "memory link closed"))?;
        Ok(copy_datagram(datagram, buf))
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let would_block = || io::Error::from(io::ErrorKind::WouldBlock);
        let mut inbound = self.inbound.try_lock().map_err(|_| would_block())?;
        let datagram = inbound.try_recv().map_err(|_| would_block())?;
        Ok(copy_datagram(datagram, buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
