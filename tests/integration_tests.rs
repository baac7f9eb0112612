use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sqa_core::metrics::DataPoint;
use sqa_core::packet::flags;
use sqa_core::transport::memory::{MemoryTransport, SentDatagram};
use sqa_core::{
    Packet, PacketCodec, Session, SessionConfig, SqaError, HEADER_SIZE, MAX_PAYLOAD_SIZE,
    RETRANSMIT_TIMEOUT_MS,
};
use tokio::net::UdpSocket;
use tokio::time::Instant;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

const LEFT: &str = "10.0.0.1:7946";
const RIGHT: &str = "10.0.0.2:7946";

fn addr(raw: &str) -> SocketAddr {
    raw.parse().unwrap()
}

fn link() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let (a, b) = MemoryTransport::pair(addr(LEFT), addr(RIGHT));
    (Arc::new(a), Arc::new(b))
}

fn config(initial_sequence: u32) -> SessionConfig {
    SessionConfig::builder().with_initial_sequence(initial_sequence).build()
}

async fn open(
    left_config: SessionConfig,
    right_config: SessionConfig,
    a: &Arc<MemoryTransport>,
    b: &Arc<MemoryTransport>,
) -> (Session, Session) {
    let (left, right) = tokio::join!(
        Session::open(left_config, a.clone(), addr(RIGHT)),
        Session::open(right_config, b.clone(), addr(LEFT)),
    );
    (left.expect("left open failed"), right.expect("right open failed"))
}

fn is_data(datagram: &SentDatagram) -> bool {
    datagram.bytes.len() >= HEADER_SIZE && datagram.bytes[1] == 0
}

fn is_plain_ack(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE && buf[1] == flags::ACK
}

fn data_sent(transport: &MemoryTransport) -> Vec<SentDatagram> {
    transport.sent().into_iter().filter(is_data).collect()
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_send_exhausts_on_schedule() {
    let (a, b) = link();
    b.set_drop_filter(is_plain_ack);
    let (left, right) = open(config(1), config(1), &a, &b).await;

    let start = Instant::now();
    let result = left.send("hello").await;
    let elapsed = start.elapsed();

    assert_eq!(result, Err(SqaError::DeliveryExhausted { sequence: 1, retries: 3 }));
    assert!(elapsed >= Duration::from_millis(2000), "exhausted too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2100), "exhausted too late: {:?}", elapsed);

    let transmissions = data_sent(&a);
    assert_eq!(transmissions.len(), 4, "one send plus three retransmissions");
    let first = transmissions[0].at;
    for (idx, datagram) in transmissions.iter().enumerate().skip(1) {
        let offset = datagram.at - first;
        let expected = Duration::from_millis(500 * idx as u64);
        assert!(offset >= expected && offset < expected + Duration::from_millis(50),
            "retransmission {} at {:?}", idx, offset);
        assert_eq!(datagram.bytes, transmissions[0].bytes, "retransmissions resend identical bytes");
    }

    assert_eq!(left.metrics().get_count(DataPoint::Retransmissions), 3);
    assert_eq!(left.metrics().get_count(DataPoint::SendsExhausted), 1);

    // the peer saw every copy and delivers each one
    for _ in 0..4 {
        assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"hello"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_ack_prevents_retransmission() {
    let (a, b) = link();
    let (left, right) = open(config(10), config(20), &a, &b).await;

    let report = left.send("hello").await.unwrap();
    assert_eq!(report.sequence, 10);
    assert_eq!(report.retransmissions, 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(data_sent(&a).len(), 1);
    assert_eq!(left.metrics().get_count(DataPoint::Retransmissions), 0);
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"hello"));
}

#[tokio::test(start_paused = true)]
async fn test_lost_data_is_retransmitted() {
    let (a, b) = link();
    let dropped_once = Arc::new(AtomicBool::new(false));
    let flag = dropped_once.clone();
    a.set_drop_filter(move |buf| {
        buf.len() >= HEADER_SIZE && buf[1] == 0 && !flag.swap(true, Ordering::SeqCst)
    });
    let (left, right) = open(config(1), config(1), &a, &b).await;

    let start = Instant::now();
    let report = left.send("retry me").await.unwrap();

    assert_eq!(report.retransmissions, 1);
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(dropped_once.load(Ordering::SeqCst));
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"retry me"));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_ack_changes_nothing() {
    let (a, b) = link();
    let (left, _right) = open(config(7), config(1), &a, &b).await;

    let report = left.send("once").await.unwrap();
    let duplicate = PacketCodec::new(1).encode(&Packet::ack(1, report.sequence)).unwrap();
    a.inject(duplicate.clone(), addr(RIGHT));
    a.inject(duplicate, addr(RIGHT));

    // a follow-up round trip guarantees the injected ACKs were processed
    let next = left.send("twice").await.unwrap();
    assert_eq!(next.sequence, report.sequence + 1);
    assert_eq!(left.metrics().get_count(DataPoint::DuplicateAcks), 2);
    assert_eq!(left.metrics().get_count(DataPoint::AcksReceived), 2);
    assert_eq!(data_sent(&a).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_fails_both_sides() {
    let (a, b) = link();
    let v1 = SessionConfig::builder().with_version(1).build();
    let v2 = SessionConfig::builder().with_version(2).build();

    let (left, right) = tokio::join!(
        Session::open(v1, a.clone(), addr(RIGHT)),
        Session::open(v2, b.clone(), addr(LEFT)),
    );

    assert!(matches!(left, Err(SqaError::VersionMismatch { expected: 1, actual: 2 })));
    assert!(matches!(right, Err(SqaError::VersionMismatch { expected: 2, actual: 1 })));
    assert!(data_sent(&a).is_empty());
    assert!(data_sent(&b).is_empty());
    assert!(a.sent().iter().all(|datagram| datagram.bytes[1] == flags::HELLO));
}

#[tokio::test(start_paused = true)]
async fn test_payload_size_boundary() {
    let (a, b) = link();
    let (left, right) = open(config(1), config(1), &a, &b).await;

    let largest = vec![0xab; MAX_PAYLOAD_SIZE];
    left.send(largest.clone()).await.unwrap();
    assert_eq!(right.receive().await.unwrap(), Bytes::from(largest));
    assert_eq!(data_sent(&a)[0].bytes.len(), sqa_core::MAX_PACKET_SIZE);

    let result = left.send(vec![0xab; MAX_PAYLOAD_SIZE + 1]).await;
    assert_eq!(
        result,
        Err(SqaError::PayloadTooLarge { len: MAX_PAYLOAD_SIZE + 1, max: MAX_PAYLOAD_SIZE })
    );
    assert_eq!(data_sent(&a).len(), 1, "nothing transmitted for the oversize payload");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_datagrams_are_dropped() {
    let (a, b) = link();
    let (left, right) = open(config(1), config(1), &a, &b).await;

    let mut corrupted = PacketCodec::new(1)
        .encode(&Packet::data(1, 99, Bytes::from_static(b"evil")))
        .unwrap()
        .to_vec();
    corrupted[HEADER_SIZE] ^= 0xff;
    b.inject(corrupted, addr(LEFT));
    b.inject(vec![1u8, 0, 0], addr(LEFT));
    b.inject(PacketCodec::new(9).encode(&Packet::data(9, 5, Bytes::new())).unwrap(), addr(LEFT));

    left.send("still alive").await.unwrap();
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"still alive"));
    assert_eq!(right.metrics().get_count(DataPoint::MalformedDropped), 3);
    assert_eq!(right.metrics().get_count(DataPoint::Delivered), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_survives_noise_from_peer() {
    let (a, b) = link();
    // garbage that carries a foreign version byte, queued ahead of the peer's HELLO
    a.inject(vec![0x41u8; HEADER_SIZE], addr(RIGHT));
    b.inject(&b"\x02 not a packet"[..], addr(LEFT));

    let (left, right) = open(config(1), config(1), &a, &b).await;
    assert_eq!(left.metrics().get_count(DataPoint::MalformedDropped), 1);
    assert_eq!(right.metrics().get_count(DataPoint::MalformedDropped), 1);

    left.send("after noise").await.unwrap();
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"after noise"));
}

#[tokio::test(start_paused = true)]
async fn test_ack_at_deadline_wins_over_retransmission() {
    let (a, b) = link();
    let (left, right) = open(config(1), config(1), &a, &b).await;

    // DATA out plus ACK back lands exactly on the 500 ms retransmit deadline
    let half = Duration::from_millis(RETRANSMIT_TIMEOUT_MS / 2);
    a.set_latency(half);
    b.set_latency(half);

    let report = left.send("tie").await.unwrap();
    assert_eq!(report.retransmissions, 0);
    assert_eq!(report.rtt, Duration::from_millis(RETRANSMIT_TIMEOUT_MS));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(data_sent(&a).len(), 1);
    assert_eq!(left.metrics().get_count(DataPoint::Retransmissions), 0);
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"tie"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sends_complete_independently() {
    let (a, b) = link();
    let slow_dropped = Arc::new(AtomicBool::new(false));
    let flag = slow_dropped.clone();
    a.set_drop_filter(move |buf| buf.ends_with(b"slow") && !flag.swap(true, Ordering::SeqCst));
    let (left, right) = open(config(1), config(1), &a, &b).await;

    let (slow, fast) = tokio::join!(left.send("slow"), left.send("fast"));
    let (slow, fast) = (slow.unwrap(), fast.unwrap());

    assert_eq!(slow.retransmissions, 1);
    assert_eq!(fast.retransmissions, 0);
    assert_ne!(slow.sequence, fast.sequence);

    // arrival order, not sequence order
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"fast"));
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"slow"));
}

#[tokio::test(start_paused = true)]
async fn test_close_fails_pending_sends() {
    let (a, b) = link();
    b.set_drop_filter(is_plain_ack);
    let (left, _right) = open(config(1), config(1), &a, &b).await;
    let left = Arc::new(left);

    let sender = left.clone();
    let pending = tokio::spawn(async move { sender.send("never acked").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    left.close().await;
    assert_eq!(pending.await.unwrap(), Err(SqaError::SessionClosed));

    let transmitted = data_sent(&a).len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(data_sent(&a).len(), transmitted, "no retransmission after close");
    assert_eq!(left.send("after close").await, Err(SqaError::SessionClosed));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_data_is_delivered_at_least_once() {
    let (a, b) = link();
    let (_left, right) = open(config(1), config(1), &a, &b).await;

    let datagram = PacketCodec::new(1).encode(&Packet::data(1, 42, Bytes::from_static(b"dup"))).unwrap();
    b.inject(datagram.clone(), addr(LEFT));
    b.inject(datagram, addr(LEFT));

    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"dup"));
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"dup"));

    let acks = b.sent().into_iter().filter(|datagram| is_plain_ack(&datagram.bytes)).count();
    assert_eq!(acks, 2, "every copy is acknowledged");
}

#[tokio::test(start_paused = true)]
async fn test_deduplication_suppresses_redelivery() {
    let (a, b) = link();
    let right_config = SessionConfig::builder().with_initial_sequence(1).with_deduplication(16).build();
    let (left, right) = open(config(1), right_config, &a, &b).await;

    let datagram = PacketCodec::new(1).encode(&Packet::data(1, 42, Bytes::from_static(b"dup"))).unwrap();
    b.inject(datagram.clone(), addr(LEFT));
    b.inject(datagram, addr(LEFT));
    left.send("next").await.unwrap();

    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"dup"));
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"next"));
    assert_eq!(right.metrics().get_count(DataPoint::DuplicatesSuppressed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_over_lossy_link() {
    let (a, b) = link();
    a.set_loss(0.2, 42);
    b.set_loss(0.2, 4242);

    let left_config = SessionConfig::builder().with_initial_sequence(1).with_max_retries(15).build();
    let right_config = SessionConfig::builder()
        .with_initial_sequence(1)
        .with_max_retries(15)
        .with_deduplication(256)
        .build();
    let (left, right) = open(left_config, right_config, &a, &b).await;

    let expected: Vec<Bytes> = (0..20).map(|i| Bytes::from(format!("message {:02}", i))).collect();
    for payload in &expected {
        left.send(payload.clone()).await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..expected.len() {
        received.push(right.receive().await.unwrap());
    }
    received.sort();
    assert_eq!(received, expected);
    assert_eq!(right.metrics().get_count(DataPoint::Delivered), 20);
}

#[tokio::test]
async fn test_session_over_udp() {
    let left_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let right_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let left_addr = left_socket.local_addr().unwrap();
    let right_addr = right_socket.local_addr().unwrap();

    let (left, right) = tokio::join!(
        Session::open(SessionConfig::default(), left_socket, right_addr),
        Session::open(SessionConfig::default(), right_socket, left_addr),
    );
    let (left, right) = (left.unwrap(), right.unwrap());

    left.send("over the wire").await.unwrap();
    assert_eq!(right.receive().await.unwrap(), Bytes::from_static(b"over the wire"));

    right.send("and back").await.unwrap();
    assert_eq!(left.receive().await.unwrap(), Bytes::from_static(b"and back"));

    left.close().await;
    right.close().await;
}
