//! Integration tests for the Carbon write path.
//!
//! These tests run the client against local TCP and UDP listeners standing
//! in for carbon, and verify line framing, datagram sizing, LZ4 streams and
//! connection handling across writes.

use graphite_bridge::config::{CarbonTransport, CompressType};
use graphite_bridge::error::WriteError;
use graphite_bridge::write::{CarbonWriter, UDP_MAX_BYTES};
use graphite_bridge::{CancelToken, Config, GraphiteClient, Sample};
use lz4_flex::frame::FrameDecoder;
use std::io::Read;
use std::net::{TcpListener, UdpSocket};
use std::thread;
use std::time::Duration;

/// Timestamp used by every sample: 2021-01-01T00:00:00Z in milliseconds.
const TS_MS: i64 = 1_609_459_200_000;

fn config(address: &str, transport: CarbonTransport) -> Config {
    let mut config = Config::default();
    config.graphite.default_prefix = "prom.".to_string();
    config.graphite.write.carbon_address = address.to_string();
    config.graphite.write.carbon_transport = transport;
    config.write.timeout = Duration::from_secs(5);
    config
}

fn samples(count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            Sample::new(
                "node_cpu_seconds_total",
                [("cpu", i.to_string()), ("mode", "idle".to_string())],
                i as f64,
                TS_MS,
            )
        })
        .collect()
}

fn expected_lines(count: usize) -> String {
    (0..count)
        .map(|i| format!("prom.node_cpu_seconds_total.cpu.{i}.mode.idle {i}.000000 1609459200\n"))
        .collect()
}

/// Accepts one connection and reads it to EOF.
fn read_one_connection(listener: &TcpListener) -> Vec<u8> {
    let (mut stream, _) = listener.accept().unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    received
}

#[test]
fn test_tcp_plain_lines() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = GraphiteClient::new(&config(&address, CarbonTransport::Tcp)).unwrap();

    let body = client
        .write(&samples(50), 4096, None, false, &CancelToken::new())
        .unwrap();
    assert_eq!(body, b"Done.");
    client.shutdown();

    let received = read_one_connection(&listener);
    assert_eq!(String::from_utf8(received).unwrap(), expected_lines(50));
}

#[test]
fn test_tcp_connection_is_reused_across_writes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = GraphiteClient::new(&config(&address, CarbonTransport::Tcp)).unwrap();

    let token = CancelToken::new();
    client.write(&samples(2), 0, None, false, &token).unwrap();
    client.write(&samples(3), 0, None, false, &token).unwrap();
    client.shutdown();

    // Both writes arrive on the first connection.
    let received = read_one_connection(&listener);
    let expected = expected_lines(2) + &expected_lines(3);
    assert_eq!(String::from_utf8(received).unwrap(), expected);
}

#[test]
fn test_tcp_reconnects_after_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let mut config = config(&address, CarbonTransport::Tcp);
    config.graphite.write.carbon_reconnect_interval = Duration::ZERO;
    let client = GraphiteClient::new(&config).unwrap();

    let token = CancelToken::new();
    client.write(&samples(1), 0, None, false, &token).unwrap();
    client.write(&samples(2), 0, None, false, &token).unwrap();
    client.shutdown();

    // The second write closed the first connection and dialed a new one.
    assert_eq!(read_one_connection(&listener), expected_lines(1).into_bytes());
    assert_eq!(read_one_connection(&listener), expected_lines(2).into_bytes());
}

#[test]
fn test_unreachable_carbon_fails_the_write() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let client =
        GraphiteClient::new(&config(&format!("127.0.0.1:{port}"), CarbonTransport::Tcp)).unwrap();

    let err = client
        .write(&samples(1), 0, None, false, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, WriteError::Connect { .. }));
}

#[test]
fn test_carbon_going_away_between_writes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let mut config = config(&address, CarbonTransport::Tcp);
    config.graphite.write.carbon_reconnect_interval = Duration::ZERO;
    let client = GraphiteClient::new(&config).unwrap();

    let token = CancelToken::new();
    client.write(&samples(1), 0, None, false, &token).unwrap();
    assert_eq!(read_one_connection(&listener), expected_lines(1).into_bytes());
    drop(listener);

    let err = client.write(&samples(1), 0, None, false, &token).unwrap_err();
    assert!(matches!(err, WriteError::Connect { .. }));
}

#[test]
fn test_send_failure_drops_connection_and_redials() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let config = config(&address, CarbonTransport::Tcp);
    let writer = CarbonWriter::new(&config.graphite.write, config.write.timeout);
    let token = CancelToken::new();
    let lines = vec![expected_lines(1).into_bytes()];

    writer.send(&lines, &token).unwrap();
    assert!(writer.is_connected());

    // Closing with unread data makes the peer answer further writes with a
    // reset.
    let (stream, _) = listener.accept().unwrap();
    thread::sleep(Duration::from_millis(100));
    drop(stream);

    let mut failure = None;
    for _ in 0..100 {
        match writer.send(&lines, &token) {
            Ok(_) => thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let err = failure.expect("writes to a reset connection kept succeeding");
    assert!(matches!(err, WriteError::Send { .. }), "{err}");
    assert!(!writer.is_connected());

    // The cached connection is gone, so the next write dials carbon again.
    writer.send(&lines, &token).unwrap();
    assert!(writer.is_connected());
    writer.close();
    assert_eq!(read_one_connection(&listener), lines[0]);
}

#[test]
fn test_udp_datagrams_never_split_lines() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let address = receiver.local_addr().unwrap().to_string();
    let client = GraphiteClient::new(&config(&address, CarbonTransport::Udp)).unwrap();

    let count = 100;
    let expected = expected_lines(count);
    client
        .write(&samples(count), 0, None, false, &CancelToken::new())
        .unwrap();

    let mut received = String::new();
    let mut datagrams = 0;
    let mut buf = [0u8; 2048];
    while received.len() < expected.len() {
        let n = receiver.recv(&mut buf).unwrap();
        assert!(n <= UDP_MAX_BYTES, "datagram of {n} bytes");
        let datagram = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(datagram.ends_with('\n'));
        received.push_str(datagram);
        datagrams += 1;
    }
    assert_eq!(received, expected);
    assert!(datagrams > 1);
}

#[test]
fn test_lz4_stream_decodes_to_lines() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let mut config = config(&address, CarbonTransport::Tcp);
    config.graphite.write.compress_type = CompressType::Lz4;
    config.graphite.write.lz4_preferences.frame.content_checksum = true;
    let client = GraphiteClient::new(&config).unwrap();

    client
        .write(&samples(2000), 0, None, false, &CancelToken::new())
        .unwrap();
    client.shutdown();

    let compressed = read_one_connection(&listener);
    let expected = expected_lines(2000);
    assert!(compressed.len() < expected.len());

    let mut decoded = String::new();
    FrameDecoder::new(compressed.as_slice())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, expected);
}

#[test]
fn test_invalid_samples_are_skipped_and_counted() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client = GraphiteClient::new(&config(&address, CarbonTransport::Tcp)).unwrap();

    let mut batch = samples(2);
    batch.insert(1, Sample::new("bad", [("v", "nan")], f64::NAN, TS_MS));
    batch.push(Sample::new("bad", [("v", "inf")], f64::INFINITY, TS_MS));

    client
        .write(&batch, 0, None, false, &CancelToken::new())
        .unwrap();
    client.shutdown();

    assert_eq!(read_one_connection(&listener), expected_lines(2).into_bytes());
    assert_eq!(client.stats().ignored_samples, 2);
}
