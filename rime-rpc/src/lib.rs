#![forbid(unsafe_code)]

//! Line-oriented JSON-RPC 2.0 server for the adapter control plane.
//!
//! One JSON document per line. Decoded calls are handed to the single
//! registered consumer over a channel together with a oneshot responder, so
//! requests on a connection are answered in arrival order; server-initiated
//! notifications fan out to every connected client and may interleave with
//! responses.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const INTERNAL_ERROR: i64 = -32603;

/// A decoded method call awaiting its reply.
#[derive(Debug)]
pub struct RpcCall {
    pub method: String,
    pub params: Vec<Value>,
    pub responder: oneshot::Sender<Result<Value, String>>,
}

type ClientRegistry = Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>;

/// The JSON-RPC listener plus the notification fanout handle.
pub struct RpcServer {
    local_addr: SocketAddr,
    clients: ClientRegistry,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RpcServer {
    /// Bind the listener and start accepting clients. Calls arrive on the
    /// returned receiver.
    pub async fn bind(port: u16) -> std::io::Result<(Self, mpsc::UnboundedReceiver<RpcCall>)> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let local_addr = listener.local_addr()?;
        let clients: ClientRegistry = Arc::new(Mutex::new(Vec::new()));
        let (call_tx, call_rx) = mpsc::unbounded_channel();

        info!(%local_addr, "rpc listening");
        let registry = Arc::clone(&clients);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "rpc client connected");
                        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
                        registry.lock().push(line_tx.clone());
                        tokio::spawn(serve_client(
                            stream,
                            call_tx.clone(),
                            line_tx,
                            line_rx,
                            Arc::clone(&registry),
                        ));
                    }
                    Err(e) => {
                        warn!("rpc accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                local_addr,
                clients,
                accept_task,
            },
            call_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a server-initiated notification to every connected client.
    pub fn notify(&self, method: &str, params: Vec<Value>) {
        let line = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })
        .to_string();
        debug!(%method, "rpc notify");
        self.clients
            .lock()
            .retain(|client| client.send(line.clone()).is_ok());
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_client(
    stream: TcpStream,
    calls: mpsc::UnboundedSender<RpcCall>,
    line_tx: mpsc::UnboundedSender<String>,
    mut line_rx: mpsc::UnboundedReceiver<String>,
    registry: ClientRegistry,
) {
    let framed = Framed::new(stream, LinesCodec::new());
    let (mut sink, mut lines) = framed.split();

    let writer = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                warn!("rpc read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = dispatch_line(&line, &calls).await {
            if line_tx.send(response).is_err() {
                break;
            }
        }
    }

    writer.abort();
    registry.lock().retain(|client| !client.same_channel(&line_tx));
    debug!("rpc client disconnected");
}

/// Handle one request line; `None` means no response is owed (client-side
/// notification).
async fn dispatch_line(line: &str, calls: &mpsc::UnboundedSender<RpcCall>) -> Option<String> {
    let doc: Value = match serde_json::from_str(line) {
        Ok(doc) => doc,
        Err(e) => {
            return Some(error_response(
                Value::Null,
                PARSE_ERROR,
                &format!("parse error: {e}"),
            ));
        }
    };
    let id = doc.get("id").cloned();
    let Some(method) = doc.get("method").and_then(Value::as_str) else {
        return id.map(|id| error_response(id, INVALID_REQUEST, "missing method"));
    };
    let params = doc
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let (responder, result_rx) = oneshot::channel();
    if calls
        .send(RpcCall {
            method: method.to_string(),
            params,
            responder,
        })
        .is_err()
    {
        return id.map(|id| error_response(id, INTERNAL_ERROR, "server shutting down"));
    }

    let id = id?;
    match result_rx.await {
        Ok(Ok(result)) => Some(
            json!({
                "jsonrpc": "2.0",
                "result": result,
                "id": id,
            })
            .to_string(),
        ),
        Ok(Err(message)) => Some(error_response(id, INTERNAL_ERROR, &message)),
        Err(_) => Some(error_response(id, INTERNAL_ERROR, "request dropped")),
    }
}

fn error_response(id: Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": id,
    })
    .to_string()
}
