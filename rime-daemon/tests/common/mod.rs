//! Shared harness for the daemon integration tests: a running adapter plus
//! thin RPC and mock-game clients speaking the real wire formats.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use rime_core::{AdapterOptions, IceServers};
use rime_daemon::IceAdapter;
use rime_gpgnet::{GpgNetCodec, GpgNetMessage};

/// Generous bound covering candidate gathering on slow machines.
pub const WAIT: Duration = Duration::from_secs(20);

pub struct Harness {
    pub rpc: RpcClient,
    pub rpc_port: u16,
    pub gpgnet_port: u16,
    pub adapter_task: tokio::task::JoinHandle<()>,
}

/// Adapter for player 1 ("alice"), listeners on OS-assigned ports, agents
/// running with host candidates only.
pub async fn spawn_adapter() -> Harness {
    let opts = AdapterOptions::for_tests(1, "alice");
    let mut adapter = IceAdapter::bind(opts, IceServers::default())
        .await
        .expect("bind adapter");
    let rpc_port = adapter.rpc_port();
    let gpgnet_port = adapter.gpgnet_port();
    let adapter_task = tokio::spawn(async move { adapter.run().await });
    let rpc = RpcClient::connect(rpc_port).await;
    Harness {
        rpc,
        rpc_port,
        gpgnet_port,
        adapter_task,
    }
}

/// JSON-RPC client that keeps notifications read while waiting for a
/// response, so tests can assert on both without racing.
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: i64,
    pending: VecDeque<Value>,
}

impl RpcClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect rpc");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
            next_id: 0,
            pending: VecDeque::new(),
        }
    }

    async fn read_doc(&mut self) -> Value {
        let mut line = String::new();
        let n = timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("rpc read timed out")
            .expect("rpc read failed");
        assert!(n > 0, "rpc connection closed");
        serde_json::from_str(&line).expect("rpc line is not json")
    }

    /// Invoke a method and wait for its response; interleaved notifications
    /// are queued for later assertions.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, String> {
        self.next_id += 1;
        let id = self.next_id;
        let mut line = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        })
        .to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("rpc write failed");

        loop {
            let doc = self.read_doc().await;
            if doc.get("id") == Some(&json!(id)) {
                if let Some(error) = doc.get("error") {
                    return Err(error["message"]
                        .as_str()
                        .unwrap_or("malformed error")
                        .to_string());
                }
                return Ok(doc["result"].clone());
            }
            self.pending.push_back(doc);
        }
    }

    /// Next notification with the given method, draining queued ones first.
    pub async fn notification(&mut self, method: &str) -> Vec<Value> {
        if let Some(at) = self
            .pending
            .iter()
            .position(|doc| doc["method"] == json!(method))
        {
            let doc = self.pending.remove(at).expect("indexed pending entry");
            return doc["params"].as_array().cloned().unwrap_or_default();
        }
        loop {
            let doc = self.read_doc().await;
            if doc["method"] == json!(method) {
                return doc["params"].as_array().cloned().unwrap_or_default();
            }
            self.pending.push_back(doc);
        }
    }

    /// Wait for `onPeerStateChanged` to report `state` for `peer`, skipping
    /// earlier transitions.
    pub async fn wait_peer_state(&mut self, peer: i64, state: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "peer {peer} never reached {state}"
            );
            let params = self.notification("onPeerStateChanged").await;
            if params.get(1) == Some(&json!(peer)) && params.get(2) == Some(&json!(state)) {
                return;
            }
        }
    }
}

/// Mock game speaking the GPGNet wire format.
pub struct GameClient {
    framed: Framed<TcpStream, GpgNetCodec>,
}

impl GameClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect gpgnet");
        Self {
            framed: Framed::new(stream, GpgNetCodec),
        }
    }

    pub async fn send(&mut self, msg: GpgNetMessage) {
        self.framed.send(msg).await.expect("gpgnet write failed");
    }

    pub async fn send_game_state(&mut self, state: &str) {
        self.send(GpgNetMessage::new("GameState", vec![state.into()]))
            .await;
    }

    pub async fn next_message(&mut self) -> GpgNetMessage {
        timeout(WAIT, self.framed.next())
            .await
            .expect("gpgnet read timed out")
            .expect("gpgnet connection closed")
            .expect("gpgnet frame error")
    }

    /// Assert nothing arrives from the adapter for `dur`.
    pub async fn expect_silence(&mut self, dur: Duration) {
        if let Ok(msg) = timeout(dur, self.framed.next()).await {
            panic!("expected silence, got {msg:?}");
        }
    }
}
