//! Tests of the TCP bridge with real sockets on the loopback interface.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use scope_bridge::acquisition::AcquisitionEngine;
use scope_bridge::instrument::MockScope;
use scope_bridge::protocol::{Reply, ReplyStatus};
use scope_bridge::transport::framing::{encode_multipart, publish_frames};
use scope_bridge::transport::{tcp, Envelope, Multipart, TransportMux};
use scope_bridge::worker::BackendWorker;

const WAIT: Duration = Duration::from_secs(5);

async fn read_message(stream: &mut TcpStream) -> Multipart {
    let read = async {
        let count = stream.read_u32_le().await.expect("read frame count") as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = stream.read_u32_le().await.expect("read frame length") as usize;
            let mut frame = vec![0u8; len];
            stream.read_exact(&mut frame).await.expect("read frame body");
            frames.push(frame);
        }
        frames
    };
    timeout(WAIT, read).await.expect("timed out reading message")
}

async fn listener() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    (listener, addr)
}

#[tokio::test]
async fn test_request_roundtrip_over_tcp() {
    let (requests, addr) = listener().await;
    let (mux, endpoints) = TransportMux::new();
    tokio::spawn(tcp::serve_requests(requests, endpoints.peer));

    let worker = BackendWorker::new(Box::new(MockScope::new()), AcquisitionEngine::new(), mux);
    tokio::spawn(worker.run());

    let mut client = TcpStream::connect(addr).await.expect("connect failed");

    // The startup handshake is the first thing a peer sees.
    let frames = read_message(&mut client).await;
    let body = Envelope::from_frames(frames).expect("bad framing").0;
    let handshake: serde_json::Value = serde_json::from_slice(&body).expect("bad json");
    assert_eq!(handshake["type"], "handshake");

    let request = Envelope(
        br#"{"command":"raw_query","params":{"query":"*IDN?"}}"#.to_vec(),
    )
    .into_frames();
    client
        .write_all(&encode_multipart(&request))
        .await
        .expect("write failed");

    let frames = read_message(&mut client).await;
    let body = Envelope::from_frames(frames).expect("bad framing").0;
    let reply: Reply = serde_json::from_slice(&body).expect("not a reply");
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(
        reply.payload,
        Some(serde_json::Value::String("INSTR,1.0".to_string()))
    );
}

#[tokio::test]
async fn test_broadcasts_fan_out_to_all_subscribers() {
    let (feed_listener, addr) = listener().await;
    let (_mux, endpoints) = TransportMux::new();
    let feed = endpoints.console_feed.clone();
    tokio::spawn(tcp::serve_broadcasts(feed_listener, endpoints.console_feed));

    let mut first = TcpStream::connect(addr).await.expect("connect failed");
    let mut second = TcpStream::connect(addr).await.expect("connect failed");
    // Let the bridge accept and subscribe both before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let frames =
        publish_frames("backend_state", &serde_json::json!("BUSY")).expect("encode failed");
    feed.send(frames).expect("publish failed");

    for client in [&mut first, &mut second] {
        let frames = read_message(client).await;
        assert_eq!(frames[0], b"backend_state");
        assert_eq!(frames[1], b"\"BUSY\"");
    }
}

#[tokio::test]
async fn test_request_client_reconnect_is_served() {
    let (requests, addr) = listener().await;
    let (mux, endpoints) = TransportMux::new();
    tokio::spawn(tcp::serve_requests(requests, endpoints.console));

    let worker = BackendWorker::new(Box::new(MockScope::new()), AcquisitionEngine::new(), mux);
    tokio::spawn(worker.run());

    for _ in 0..2 {
        let mut client = TcpStream::connect(addr).await.expect("connect failed");
        let request = vec![br#"{"command":"set_trigger_level","params":{"level":1.0}}"#.to_vec()];
        client
            .write_all(&encode_multipart(&request))
            .await
            .expect("write failed");
        let frames = read_message(&mut client).await;
        assert_eq!(frames.len(), 1);
        let reply: Reply = serde_json::from_slice(&frames[0]).expect("not a reply");
        assert_eq!(reply.status, ReplyStatus::Ok);
        // A clean disconnect; the bridge goes back to accepting.
        drop(client);
    }
}
