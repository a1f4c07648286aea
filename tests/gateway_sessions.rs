//! Gateway sessions against a local fake gateway
//!
//! The fake speaks just enough of the protocol: hello, heartbeat ACKs,
//! READY after identify, RESUMED after resume, and records what it saw.

use arrakis_gateway_client::gateway::{Compression, Encoding, Intents, ShardStatus};
use arrakis_gateway_client::{Client, ClientOptions, GatewayError, ShardEvent};
use flate2::{Compress, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const HEARTBEAT_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Normal,
    RejectAuth,
    ReconnectOnce,
    /// Drops TCP without a close frame shortly after every READY/RESUMED
    DropAfterSession,
    /// Closes with 4004 right after READY
    RevokeAfterReady,
}

const DROP_AFTER: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Log {
    paths: Vec<String>,
    identifies: Vec<(u32, Instant, Value)>,
    resumes: Vec<Value>,
    presences: usize,
    connections: usize,
}

struct FakeGateway {
    addr: SocketAddr,
    log: Arc<Mutex<Log>>,
}

impl FakeGateway {
    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Log::default()));

        let accept_log = Arc::clone(&log);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, addr, script, Arc::clone(&accept_log)));
            }
        });

        Self { addr, log }
    }

    fn options(&self, shards: u32, identify_interval_ms: u64) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.token = Some("test-token".to_string());
        options.ws.gateway_url = Some(format!("ws://{}", self.addr));
        options.ws.compression = Compression::Disabled;
        options.ws.encoding = Encoding::Json;
        options.shards.shard_count = Some(shards);
        options.shards.min_shard_id = Some(0);
        options.shards.max_shard_id = Some(shards - 1);
        options.shards.identify_interval_ms = identify_interval_ms;
        options.backoff.initial_delay_ms = 10;
        options.backoff.max_delay_ms = 50;
        options.backoff.max_connect_attempts = 3;
        options.backoff.connect_timeout_ms = 5_000;
        options
    }

    async fn wait_for(&self, what: impl Fn(&Log) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !what(&self.log.lock()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fake gateway never saw the expected traffic");
    }
}

struct Outbound {
    zlib: Option<Compress>,
}

impl Outbound {
    async fn send(&mut self, ws: &mut WebSocketStream<TcpStream>, value: Value) {
        let text = value.to_string();
        let message = match self.zlib.as_mut() {
            Some(zlib) => {
                let mut out = Vec::with_capacity(text.len() * 2 + 64);
                zlib.compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
                    .unwrap();
                Message::Binary(out)
            }
            None => Message::Text(text),
        };
        // The client may already be gone.
        let _ = ws.send(message).await;
    }
}

async fn serve(stream: TcpStream, addr: SocketAddr, script: Script, log: Arc<Mutex<Log>>) {
    let path_log = Arc::clone(&log);
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path_log.lock().paths.push(req.uri().to_string());
        Ok(resp)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let (connection, compressed) = {
        let mut log = log.lock();
        log.connections += 1;
        let path = log.paths.last().cloned().unwrap_or_default();
        (log.connections, path.contains("compress=zlib-stream"))
    };
    let mut out = Outbound {
        zlib: compressed.then(|| Compress::new(flate2::Compression::default(), true)),
    };

    out.send(
        &mut ws,
        json!({"op": 10, "d": {"heartbeat_interval": HEARTBEAT_INTERVAL_MS}}),
    )
    .await;

    let mut seq = 0u64;
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap();

        match frame["op"].as_u64() {
            Some(1) => out.send(&mut ws, json!({"op": 11})).await,
            Some(2) => {
                let shard = frame["d"]["shard"][0].as_u64().unwrap() as u32;
                log.lock()
                    .identifies
                    .push((shard, Instant::now(), frame["d"].clone()));

                if script == Script::RejectAuth {
                    let close = CloseFrame {
                        code: CloseCode::from(4004),
                        reason: "Authentication failed".into(),
                    };
                    let _ = ws.close(Some(close)).await;
                    continue;
                }

                seq += 1;
                out.send(
                    &mut ws,
                    json!({
                        "op": 0, "t": "READY", "s": seq,
                        "d": {
                            "session_id": format!("session-{shard}"),
                            "resume_gateway_url": format!("ws://{addr}/resume"),
                            "shard": frame["d"]["shard"].clone(),
                        }
                    }),
                )
                .await;
                seq += 1;
                out.send(
                    &mut ws,
                    json!({
                        "op": 0, "t": "MESSAGE_CREATE", "s": seq,
                        "d": {"channel_id": "1", "content": format!("hello from {shard}")}
                    }),
                )
                .await;

                match script {
                    Script::ReconnectOnce if connection == 1 => {
                        out.send(&mut ws, json!({"op": 7, "d": null})).await;
                    }
                    Script::DropAfterSession => {
                        tokio::time::sleep(DROP_AFTER).await;
                        return;
                    }
                    Script::RevokeAfterReady => {
                        let close = CloseFrame {
                            code: CloseCode::from(4004),
                            reason: "Authentication failed".into(),
                        };
                        let _ = ws.close(Some(close)).await;
                    }
                    _ => {}
                }
            }
            Some(3) => log.lock().presences += 1,
            Some(6) => {
                seq = frame["d"]["seq"].as_u64().unwrap_or(0);
                log.lock().resumes.push(frame["d"].clone());
                seq += 1;
                out.send(&mut ws, json!({"op": 0, "t": "RESUMED", "s": seq, "d": null}))
                    .await;
                if script == Script::DropAfterSession {
                    tokio::time::sleep(DROP_AFTER).await;
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn collect(events: &mut mpsc::Receiver<ShardEvent>, count: usize) -> Vec<ShardEvent> {
    let mut collected = Vec::with_capacity(count);
    while collected.len() < count {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        collected.push(event);
    }
    collected
}

#[tokio::test]
async fn test_shards_identify_in_order_with_spacing() {
    let gateway = FakeGateway::start(Script::Normal).await;
    let client = Client::builder(gateway.options(3, 200)).build().unwrap();

    let mut events = timeout(Duration::from_secs(10), client.login())
        .await
        .expect("login timed out")
        .unwrap();
    assert_eq!(client.status(), ShardStatus::Connected);

    let identifies: Vec<(u32, Instant, Value)> = gateway.log.lock().identifies.clone();
    let order: Vec<u32> = identifies.iter().map(|(shard, _, _)| *shard).collect();
    assert_eq!(order, vec![0, 1, 2]);
    for pair in identifies.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(180));
    }
    for (shard, _, d) in &identifies {
        assert_eq!(d["token"], "test-token");
        assert_eq!(d["shard"], json!([shard, 3]));
        assert_eq!(d["intents"], json!(Intents::default().bits()));
        assert_eq!(d["large_threshold"], 250);
    }
    assert!(gateway
        .log
        .lock()
        .paths
        .iter()
        .all(|p| p == "/?v=10&encoding=json"));

    let received = collect(&mut events, 6).await;
    let ready: Vec<u32> = received
        .iter()
        .filter(|e| matches!(e, ShardEvent::Ready { .. }))
        .map(ShardEvent::shard_id)
        .collect();
    assert_eq!(ready, vec![0, 1, 2]);
    for event in received.iter().filter(|e| e.name() == "MESSAGE_CREATE") {
        match event {
            ShardEvent::Dispatch { seq, data, shard_id, .. } => {
                assert_eq!(*seq, Some(2));
                assert_eq!(data["content"], format!("hello from {shard_id}"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    client
        .update_presence(None, json!({"status": "dnd", "afk": false, "since": null, "activities": []}))
        .await
        .unwrap();
    gateway.wait_for(|log| log.presences == 3).await;

    timeout(Duration::from_secs(5), async {
        while client.ping().is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no heartbeat ACK recorded");

    client.destroy().await;
    assert_eq!(client.status(), ShardStatus::Idle);
}

#[tokio::test]
async fn test_fatal_close_fails_login() {
    let gateway = FakeGateway::start(Script::RejectAuth).await;
    let client = Client::builder(gateway.options(2, 50)).build().unwrap();

    let result = timeout(Duration::from_secs(10), client.login())
        .await
        .expect("login timed out");
    match result {
        Err(GatewayError::FatalSession { shard_id, code, .. }) => {
            assert_eq!(shard_id, 0);
            assert_eq!(code, 4004);
        }
        other => panic!("expected a fatal session error, got {other:?}"),
    }

    assert_eq!(gateway.log.lock().identifies.len(), 1);
    assert_eq!(client.status(), ShardStatus::Idle);
}

#[tokio::test]
async fn test_reconnect_request_resumes_on_resume_url() {
    let gateway = FakeGateway::start(Script::ReconnectOnce).await;
    let client = Client::builder(gateway.options(1, 50)).build().unwrap();

    let mut events = timeout(Duration::from_secs(10), client.login())
        .await
        .expect("login timed out")
        .unwrap();

    let received = collect(&mut events, 3).await;
    assert_eq!(
        received.iter().map(ShardEvent::name).collect::<Vec<_>>(),
        vec!["READY", "MESSAGE_CREATE", "RESUMED"]
    );

    {
        let log = gateway.log.lock();
        assert_eq!(log.identifies.len(), 1);
        assert_eq!(log.resumes.len(), 1);
        assert_eq!(log.resumes[0]["session_id"], "session-0");
        assert_eq!(log.resumes[0]["seq"], 2);
        assert_eq!(log.resumes[0]["token"], "test-token");
        assert!(log.paths[1].starts_with("/resume?v=10&encoding=json"));
    }

    assert_eq!(client.status(), ShardStatus::Connected);
    client.destroy().await;
}

#[tokio::test]
async fn test_zlib_stream_transport() {
    let gateway = FakeGateway::start(Script::Normal).await;
    let mut options = gateway.options(1, 50);
    options.ws.compression = Compression::ZlibStream;
    let client = Client::builder(options).build().unwrap();

    let mut events = timeout(Duration::from_secs(10), client.login())
        .await
        .expect("login timed out")
        .unwrap();

    let received = collect(&mut events, 2).await;
    assert_eq!(received[0].name(), "READY");
    match &received[1] {
        ShardEvent::Dispatch { name, data, .. } => {
            assert_eq!(name, "MESSAGE_CREATE");
            assert_eq!(data["content"], "hello from 0");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        gateway.log.lock().paths[0],
        "/?v=10&encoding=json&compress=zlib-stream"
    );

    client.destroy().await;
}

#[tokio::test]
async fn test_dropped_sessions_keep_resuming() {
    let gateway = FakeGateway::start(Script::DropAfterSession).await;
    let client = Client::builder(gateway.options(1, 50)).build().unwrap();

    let mut events = timeout(Duration::from_secs(10), client.login())
        .await
        .expect("login timed out")
        .unwrap();

    // More drops than max_connect_attempts, each after a healthy session.
    let received = collect(&mut events, 7).await;
    assert_eq!(
        received.iter().map(ShardEvent::name).collect::<Vec<_>>(),
        vec!["READY", "MESSAGE_CREATE", "RESUMED", "RESUMED", "RESUMED", "RESUMED", "RESUMED"]
    );
    assert_ne!(client.status(), ShardStatus::Idle);

    {
        let log = gateway.log.lock();
        assert_eq!(log.identifies.len(), 1);
        assert!(log.resumes.len() >= 5);
        assert!(log.resumes.iter().all(|r| r["session_id"] == "session-0"));
    }

    client.destroy().await;
    assert_eq!(client.status(), ShardStatus::Idle);
}

#[tokio::test]
async fn test_fatal_close_after_login_terminates_stream() {
    let gateway = FakeGateway::start(Script::RevokeAfterReady).await;
    let client = Client::builder(gateway.options(1, 50)).build().unwrap();

    let mut events = timeout(Duration::from_secs(10), client.login())
        .await
        .expect("login timed out")
        .unwrap();

    let received = collect(&mut events, 3).await;
    assert_eq!(received[0].name(), "READY");
    assert_eq!(received[1].name(), "MESSAGE_CREATE");
    match &received[2] {
        ShardEvent::Terminated { shard_id, code, .. } => {
            assert_eq!(*shard_id, 0);
            assert_eq!(*code, Some(4004));
        }
        other => panic!("expected a terminal event, got {other:?}"),
    }

    assert_eq!(client.status(), ShardStatus::Idle);
    assert_eq!(gateway.log.lock().connections, 1);
    client.destroy().await;
}
