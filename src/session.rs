/// Session endpoint - reliable send/receive between two peers
///
/// Opening a session runs the version handshake on the caller's task and then
/// spawns one driver task that owns the delivery tracker, the retransmission
/// timer and the receive side of the transport. Sends reach the driver over a
/// command channel, so inserts, ACK removals and timer updates of outstanding
/// packets are never interleaved.
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::dedup::DuplicateFilter;
use crate::errors::{Result, SqaError};
use crate::metrics::{DataPoint, SessionMetrics};
use crate::packet::{Packet, PacketCodec, PacketKind, MAX_PAYLOAD_SIZE};
use crate::timer::RetransmitTimer;
use crate::tracker::{AckOutcome, Completion, DeliveryReport, DeliveryTracker, TimerOutcome};
use crate::transport::Transport;
use crate::MAX_PACKET_SIZE;

// one spare byte so datagrams above the packet limit are detected instead of truncated
const RECEIVE_BUFFER_SIZE: usize = MAX_PACKET_SIZE + 1;

enum Command {
    Send { payload: Bytes, completion: Completion },
    Close { done: oneshot::Sender<()> },
}

/// An established SQA session with a single peer
pub struct Session {
    config: Arc<SessionConfig>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    metrics: Arc<SessionMetrics>,
}

impl Session {
    /// Bind a UDP socket on the configured port and open a session to `peer`
    pub async fn connect(config: SessionConfig, peer: SocketAddr) -> Result<Session> {
        let bind_addr: SocketAddr = if peer.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, config.port).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, config.port).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Self::open(config, socket, peer).await
    }

    /// Perform the version handshake with `peer` over `transport`
    ///
    /// # Errors
    /// - `InvalidConfig` if the configuration does not validate
    /// - `VersionMismatch` if the peer announces a different protocol version
    /// - `HandshakeTimeout` if the peer does not answer within
    ///   `max_retries + 1` handshake timeouts
    pub async fn open<T>(config: SessionConfig, transport: T, peer: SocketAddr) -> Result<Session>
    where
        T: Transport + 'static,
    {
        config.validate()?;

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let local_addr = transport.local_addr()?;
        let codec = PacketCodec::new(config.version);
        let initial_sequence = config.initial_sequence.unwrap_or_else(rand::random);
        let metrics = Arc::new(SessionMetrics::new());

        handshake(transport.as_ref(), &codec, &config, peer, initial_sequence, &metrics).await?;
        info!("session {} <-> {} established, protocol version {}", local_addr, peer, config.version);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            transport,
            codec,
            peer,
            tracker: DeliveryTracker::new(config.retransmit_timeout, config.max_retries),
            timer: RetransmitTimer::new(),
            next_sequence: initial_sequence,
            dedup: config.deduplicate.then(|| DuplicateFilter::new(config.dedup_window)),
            commands: command_rx,
            inbound: inbound_tx,
            metrics: metrics.clone(),
        };
        tokio::spawn(driver.run());

        Ok(Session {
            config: Arc::new(config),
            local_addr,
            peer_addr: peer,
            commands: command_tx,
            inbound: Mutex::new(inbound_rx),
            metrics,
        })
    }

    /// Send `payload` reliably
    ///
    /// Resolves once the peer acknowledged the packet, or fails with
    /// `DeliveryExhausted` after `max_retries` unanswered retransmissions.
    /// Oversize payloads are rejected before anything is put on the wire.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<DeliveryReport> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            self.metrics.increment(DataPoint::OversizeRejected);
            return Err(SqaError::PayloadTooLarge { len: payload.len(), max: MAX_PAYLOAD_SIZE });
        }

        let (completion, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, completion })
            .map_err(|_| SqaError::SessionClosed)?;

        outcome.await.map_err(|_| SqaError::SessionClosed)?
    }

    /// Next payload received from the peer, in arrival order
    ///
    /// Every call continues where the previous one stopped. Fails with
    /// `SessionClosed` once the session is closed and all buffered payloads
    /// have been handed out.
    pub async fn receive(&self) -> Result<Bytes> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(SqaError::SessionClosed)
    }

    /// Stop the session, failing every send that is still waiting for an ACK
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = closed.await;
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }
}

/// Exchange HELLO packets until the peer answers with a compatible version
async fn handshake(
    transport: &dyn Transport,
    codec: &PacketCodec,
    config: &SessionConfig,
    peer: SocketAddr,
    initial_sequence: u32,
    metrics: &SessionMetrics,
) -> Result<()> {
    let hello = codec.encode(&Packet::hello(codec.version(), initial_sequence))?;
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut attempts = 0u32;

    loop {
        transport.send_to(&hello, peer).await?;
        attempts += 1;
        trace!("sent HELLO to {} (attempt {})", peer, attempts);

        let deadline = Instant::now() + config.handshake_timeout;
        loop {
            let (len, from) = tokio::select! {
                received = transport.recv_from(&mut buf) => received?,
                _ = sleep_until(deadline) => break,
            };
            if from != peer {
                debug!("ignoring datagram from {} during handshake with {}", from, peer);
                continue;
            }

            match codec.decode(&buf[..len]) {
                Ok(packet) if packet.kind == PacketKind::Hello => {
                    let answer = codec.encode(&Packet::hello_ack(codec.version(), initial_sequence))?;
                    transport.send_to(&answer, peer).await?;
                    return Ok(());
                }
                Ok(packet) if packet.kind == PacketKind::HelloAck => return Ok(()),
                Ok(packet) => {
                    trace!("ignoring {:?} packet {} before handshake completed", packet.kind, packet.sequence);
                }
                Err(SqaError::VersionMismatch { expected, actual }) => {
                    warn!("peer {} speaks protocol version {}, expected {}", peer, actual, expected);
                    // make sure the peer learns about the mismatch as well
                    let _ = transport.send_to(&hello, peer).await;
                    return Err(SqaError::VersionMismatch { expected, actual });
                }
                Err(e) => {
                    debug!("dropping handshake datagram from {}: {}", from, e);
                    metrics.increment(DataPoint::MalformedDropped);
                }
            }
        }

        if attempts > config.max_retries {
            warn!("no handshake answer from {} after {} attempts", peer, attempts);
            return Err(SqaError::HandshakeTimeout { attempts });
        }
    }
}

struct Driver {
    transport: Arc<dyn Transport>,
    codec: PacketCodec,
    peer: SocketAddr,
    tracker: DeliveryTracker,
    timer: RetransmitTimer,
    next_sequence: u32,
    dedup: Option<DuplicateFilter>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<Bytes>,
    metrics: Arc<SessionMetrics>,
}

impl Driver {
    async fn run(mut self) {
        let transport = self.transport.clone();
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

        loop {
            let deadline = self.timer.next_deadline();

            // inbound first: an ACK that is already waiting beats a timer firing at the same instant,
            // on_deadline repeats the check for datagrams that land on the deadline itself
            tokio::select! {
                biased;

                received = transport.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                    Err(e) => warn!("receive from transport failed: {}", e),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send { payload, completion }) => self.on_send(payload, completion).await,
                    Some(Command::Close { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline(&mut buf).await;
                }
            }
        }
    }

    async fn on_send(&mut self, payload: Bytes, completion: Completion) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let bytes = match self.codec.encode(&Packet::data(self.codec.version(), sequence, payload)) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = completion.send(Err(e));
                return;
            }
        };

        if let Err(e) = self.transport.send_to(&bytes, self.peer).await {
            warn!("sending packet {} to {} failed: {}", sequence, self.peer, e);
            let _ = completion.send(Err(e.into()));
            return;
        }
        trace!("sent packet {} ({} bytes) to {}", sequence, bytes.len(), self.peer);
        self.metrics.increment(DataPoint::DataSent);

        let deadline = self.tracker.register(sequence, bytes, Instant::now(), completion);
        self.timer.schedule(sequence, deadline);
    }

    async fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        if from != self.peer {
            debug!("ignoring datagram from unknown sender {}", from);
            return;
        }

        let packet = match self.codec.decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {}: {}", from, e);
                self.metrics.increment(DataPoint::MalformedDropped);
                return;
            }
        };

        match packet.kind {
            PacketKind::Ack => match self.tracker.on_ack(packet.sequence, Instant::now()) {
                AckOutcome::Acked(_) => self.metrics.increment(DataPoint::AcksReceived),
                AckOutcome::Ignored => self.metrics.increment(DataPoint::DuplicateAcks),
            },
            PacketKind::Data => self.on_data(packet).await,
            PacketKind::Hello => {
                // our HELLO_ACK got lost, the peer is still handshaking
                debug!("answering repeated HELLO from {}", from);
                self.reply(Packet::hello_ack(self.codec.version(), self.next_sequence)).await;
            }
            PacketKind::HelloAck => trace!("ignoring late HELLO_ACK from {}", from),
        }
    }

    async fn on_data(&mut self, packet: Packet) {
        self.metrics.increment(DataPoint::DataReceived);
        self.reply(Packet::ack(self.codec.version(), packet.sequence)).await;

        if let Some(dedup) = &mut self.dedup {
            if !dedup.first_arrival(packet.sequence) {
                trace!("suppressing duplicate packet {}", packet.sequence);
                self.metrics.increment(DataPoint::DuplicatesSuppressed);
                return;
            }
        }

        if self.inbound.send(packet.payload).is_ok() {
            self.metrics.increment(DataPoint::Delivered);
        }
    }

    async fn on_deadline(&mut self, buf: &mut [u8]) {
        // let tasks woken at this instant hand over their datagrams first
        tokio::task::yield_now().await;
        loop {
            match self.transport.try_recv_from(buf) {
                Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("receive from transport failed: {}", e);
                    break;
                }
            }
        }

        let now = Instant::now();
        for sequence in self.timer.pop_expired(now) {
            match self.tracker.on_timer(sequence, now) {
                TimerOutcome::Retransmit { bytes, deadline } => {
                    if let Err(e) = self.transport.send_to(&bytes, self.peer).await {
                        warn!("retransmitting packet {} failed: {}", sequence, e);
                    }
                    self.metrics.increment(DataPoint::Retransmissions);
                    self.timer.schedule(sequence, deadline);
                }
                TimerOutcome::Exhausted => {
                    warn!("giving up on packet {} to {}", sequence, self.peer);
                    self.metrics.increment(DataPoint::SendsExhausted);
                }
                TimerOutcome::Stale => {}
            }
        }
    }

    async fn reply(&self, packet: Packet) {
        let result = match self.codec.encode(&packet) {
            Ok(bytes) => self.transport.send_to(&bytes, self.peer).await.map_err(SqaError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("sending {:?} {} to {} failed: {}", packet.kind, packet.sequence, self.peer, e);
        }
    }

    fn shutdown(&mut self) {
        self.timer.clear();
        let failed = self.tracker.close_all();
        self.metrics.add(DataPoint::SendsExhausted, failed as u64);
        info!("session with {} closed, {} pending sends failed", self.peer, failed);
    }
}
