//! Lifecycle wrapper around the `webrtc-ice` agent.
//!
//! The library hands us credentials, trickled candidates and a datagram
//! `Conn` once a pair is nominated; this module owns the state machine the
//! rest of the adapter observes and the session-description blob exchanged
//! through the signaling plane. Both ends of a connection run the adapter, so
//! the blob format is internal:
//!
//! ```text
//! v=1
//! u=<ufrag>
//! p=<pwd>
//! c=<candidate line>     (zero or more)
//! ```
//!
//! transported base64-encoded end to end.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ice::agent::agent_config::AgentConfig;
use ice::agent::Agent;
use ice::candidate::candidate_base::unmarshal_candidate;
use ice::candidate::Candidate;
use ice::network_type::NetworkType;
use ice::state::ConnectionState as LibConnectionState;
use ice::url::Url;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use util::Conn;

use rime_core::IceServers;

/// Largest datagram the adapter moves in either direction.
pub(crate) const MAX_DATAGRAM: usize = 2048;

pub type Result<T, E = IceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IceError {
    #[error("gathering already started")]
    AlreadyStarted,
    #[error("invalid sdp: {0}")]
    InvalidSdp(String),
    #[error("agent is not connected")]
    NotConnected,
    #[error("ice: {0}")]
    Ice(#[from] ice::Error),
    #[error("transport: {0}")]
    Transport(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Observable agent lifecycle. `Failed` is terminal; `Disconnected` may
/// return to `Checking` if the library restarts its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    New,
    Gathering,
    AwaitingRemoteSdp,
    Checking,
    Connected,
    Disconnected,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::New => "New",
            AgentState::Gathering => "Gathering",
            AgentState::AwaitingRemoteSdp => "AwaitingRemoteSdp",
            AgentState::Checking => "Checking",
            AgentState::Connected => "Connected",
            AgentState::Disconnected => "Disconnected",
            AgentState::Failed => "Failed",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type StateCallback = Box<dyn Fn(AgentState) + Send + Sync + 'static>;
type SharedState = Arc<RwLock<AgentState>>;
type SharedStateCallback = Arc<RwLock<Option<StateCallback>>>;

fn map_lib_state(state: LibConnectionState) -> Option<AgentState> {
    match state {
        LibConnectionState::Checking => Some(AgentState::Checking),
        LibConnectionState::Connected | LibConnectionState::Completed => {
            Some(AgentState::Connected)
        }
        LibConnectionState::Disconnected => Some(AgentState::Disconnected),
        LibConnectionState::Failed => Some(AgentState::Failed),
        _ => None,
    }
}

fn transition(state: &SharedState, cb: &SharedStateCallback, next: AgentState) {
    {
        let mut current = state.write();
        if *current == next {
            return;
        }
        debug!(from = %*current, to = %next, "ice agent state");
        *current = next;
    }
    if let Some(cb) = cb.read().as_ref() {
        cb(next);
    }
}

/// The session-description blob carried over the signaling plane.
pub(crate) struct SessionBlob {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<String>,
}

impl SessionBlob {
    pub(crate) fn encode(&self) -> String {
        let mut out = String::from("v=1\n");
        out.push_str(&format!("u={}\n", self.ufrag));
        out.push_str(&format!("p={}\n", self.pwd));
        for candidate in &self.candidates {
            out.push_str(&format!("c={candidate}\n"));
        }
        out
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        if lines.next() != Some("v=1") {
            return Err(IceError::InvalidSdp(
                "unsupported description version".to_string(),
            ));
        }
        let mut ufrag = None;
        let mut pwd = None;
        let mut candidates = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some(("u", value)) => ufrag = Some(value.to_string()),
                Some(("p", value)) => pwd = Some(value.to_string()),
                Some(("c", value)) => candidates.push(value.to_string()),
                _ => {
                    return Err(IceError::InvalidSdp(format!("unrecognized line {line:?}")));
                }
            }
        }
        let ufrag =
            ufrag.ok_or_else(|| IceError::InvalidSdp("missing ufrag".to_string()))?;
        let pwd = pwd.ok_or_else(|| IceError::InvalidSdp("missing password".to_string()))?;
        Ok(Self {
            ufrag,
            pwd,
            candidates,
        })
    }
}

/// Wrapper owning one `webrtc-ice` agent and its datagram plane.
pub struct IceAgent {
    agent: Arc<Agent>,
    controlling: bool,
    state: SharedState,
    state_cb: SharedStateCallback,
    gathered: Arc<Mutex<Vec<String>>>,
    gather_started: AtomicBool,
    checks_started: AtomicBool,
    local_sdp: Arc<OnceCell<String>>,
    remote_sdp64: RwLock<Option<String>>,
    sink: Arc<RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    conn: Arc<OnceCell<Arc<dyn Conn + Send + Sync>>>,
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
    io_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IceAgent {
    /// Build an agent against the resolved traversal servers. `controlling`
    /// decides which side dials once connectivity checks start; the adapter
    /// gives that role to the peer with the smaller player id.
    pub async fn new(servers: &IceServers, controlling: bool) -> Result<Self> {
        let mut urls = Vec::new();
        if let Some(stun) = servers.stun {
            urls.push(Url::parse_url(&format!("stun:{stun}"))?);
        }
        if let Some(turn) = &servers.turn {
            let mut url = Url::parse_url(&format!("turn:{}?transport=udp", turn.addr))?;
            url.username = turn.username.clone();
            url.password = turn.password.clone();
            urls.push(url);
        }

        let agent = Arc::new(
            Agent::new(AgentConfig {
                urls,
                network_types: vec![NetworkType::Udp4],
                ..AgentConfig::default()
            })
            .await?,
        );

        let state: SharedState = Arc::new(RwLock::new(AgentState::New));
        let state_cb: SharedStateCallback = Arc::new(RwLock::new(None));
        {
            let state = Arc::clone(&state);
            let state_cb = Arc::clone(&state_cb);
            agent.on_connection_state_change(Box::new(move |lib_state| {
                if let Some(next) = map_lib_state(lib_state) {
                    transition(&state, &state_cb, next);
                }
                Box::pin(async {})
            }));
        }

        Ok(Self {
            agent,
            controlling,
            state,
            state_cb,
            gathered: Arc::new(Mutex::new(Vec::new())),
            gather_started: AtomicBool::new(false),
            checks_started: AtomicBool::new(false),
            local_sdp: Arc::new(OnceCell::new()),
            remote_sdp64: RwLock::new(None),
            sink: Arc::new(RwLock::new(None)),
            conn: Arc::new(OnceCell::new()),
            cancel_tx: Mutex::new(None),
            io_task: Mutex::new(None),
        })
    }

    /// Register the observer invoked on every state transition.
    pub fn set_state_callback(&self, cb: impl Fn(AgentState) + Send + Sync + 'static) {
        *self.state_cb.write() = Some(Box::new(cb));
    }

    /// Register the sink receiving datagrams from the remote peer.
    pub fn set_receive_sink(&self, tx: mpsc::UnboundedSender<Vec<u8>>) {
        *self.sink.write() = Some(tx);
    }

    /// Start candidate gathering. `on_sdp` fires exactly once, with the
    /// base64-encoded local session description, when gathering completes.
    pub async fn gather(&self, on_sdp: impl FnOnce(String) + Send + 'static) -> Result<()> {
        if self.gather_started.swap(true, Ordering::SeqCst) {
            return Err(IceError::AlreadyStarted);
        }
        transition(&self.state, &self.state_cb, AgentState::Gathering);

        let (ufrag, pwd) = self.agent.get_local_user_credentials().await;
        let gathered = Arc::clone(&self.gathered);
        let state = Arc::clone(&self.state);
        let state_cb = Arc::clone(&self.state_cb);
        let local_sdp = Arc::clone(&self.local_sdp);
        let done: Arc<Mutex<Option<Box<dyn FnOnce(String) + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(on_sdp))));

        self.agent.on_candidate(Box::new(move |candidate| {
            match candidate {
                Some(c) => gathered.lock().push(c.marshal()),
                None => {
                    // End of gathering; assemble the blob exactly once.
                    if let Some(cb) = done.lock().take() {
                        let blob = SessionBlob {
                            ufrag: ufrag.clone(),
                            pwd: pwd.clone(),
                            candidates: gathered.lock().clone(),
                        };
                        let encoded = blob.encode();
                        let _ = local_sdp.set(encoded.clone());
                        transition(&state, &state_cb, AgentState::AwaitingRemoteSdp);
                        cb(BASE64.encode(encoded));
                    }
                }
            }
            Box::pin(async {})
        }));

        self.agent.gather_candidates()?;
        Ok(())
    }

    /// Inject the remote session description and start connectivity checks.
    /// A second call merges additional candidates into the running session.
    pub async fn set_remote_sdp(&self, sdp64: &str) -> Result<()> {
        if self.is_connected() {
            warn!("remote description received while already connected");
        }
        let raw = BASE64
            .decode(sdp64)
            .map_err(|e| IceError::InvalidSdp(format!("base64: {e}")))?;
        let text = String::from_utf8(raw)
            .map_err(|_| IceError::InvalidSdp("not valid utf-8".to_string()))?;
        let blob = SessionBlob::parse(&text)?;

        *self.remote_sdp64.write() = Some(sdp64.to_string());
        for line in &blob.candidates {
            let candidate: Arc<dyn Candidate + Send + Sync> = Arc::new(
                unmarshal_candidate(line)
                    .map_err(|e| IceError::InvalidSdp(format!("candidate: {e}")))?,
            );
            self.agent.add_remote_candidate(&candidate)?;
        }

        if self.checks_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        transition(&self.state, &self.state_cb, AgentState::Checking);

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        *self.cancel_tx.lock() = Some(cancel_tx);

        let agent = Arc::clone(&self.agent);
        let controlling = self.controlling;
        let conn_cell = Arc::clone(&self.conn);
        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.state);
        let state_cb = Arc::clone(&self.state_cb);
        let remote_ufrag = blob.ufrag;
        let remote_pwd = blob.pwd;

        let task = tokio::spawn(async move {
            let dialed = if controlling {
                agent
                    .dial(cancel_rx, remote_ufrag, remote_pwd)
                    .await
                    .map(|c| c as Arc<dyn Conn + Send + Sync>)
            } else {
                agent
                    .accept(cancel_rx, remote_ufrag, remote_pwd)
                    .await
                    .map(|c| c as Arc<dyn Conn + Send + Sync>)
            };
            let conn: Arc<dyn Conn + Send + Sync> = match dialed {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("connectivity establishment failed: {e}");
                    transition(&state, &state_cb, AgentState::Failed);
                    return;
                }
            };
            let _ = conn_cell.set(Arc::clone(&conn));

            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match conn.recv(&mut buf).await {
                    Ok(len) => {
                        if let Some(tx) = sink.read().as_ref() {
                            let _ = tx.send(buf[..len].to_vec());
                        }
                    }
                    Err(e) => {
                        debug!("ice receive loop ended: {e}");
                        break;
                    }
                }
            }
        });
        *self.io_task.lock() = Some(task);
        Ok(())
    }

    /// Send one datagram to the remote peer. Only legal while `Connected`.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(IceError::NotConnected);
        }
        let conn = self.conn.get().ok_or(IceError::NotConnected)?;
        conn.send(payload)
            .await
            .map_err(|e| IceError::Transport(e.to_string()))?;
        Ok(())
    }

    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == AgentState::Connected
    }

    /// Plain local session description; empty until gathering completes.
    pub fn local_sdp(&self) -> String {
        self.local_sdp.get().cloned().unwrap_or_default()
    }

    /// Base64 form of [`Self::local_sdp`].
    pub fn local_sdp64(&self) -> String {
        self.local_sdp
            .get()
            .map(|sdp| BASE64.encode(sdp))
            .unwrap_or_default()
    }

    /// The remote description as delivered through the signaling plane.
    pub fn remote_sdp64(&self) -> String {
        self.remote_sdp64.read().clone().unwrap_or_default()
    }

    /// Candidate line of the nominated local candidate; empty before
    /// nomination.
    pub async fn local_candidate_info(&self) -> String {
        match self.agent.get_selected_candidate_pair() {
            Some(pair) => pair.local.marshal(),
            None => String::new(),
        }
    }

    /// Candidate line of the nominated remote candidate; empty before
    /// nomination.
    pub async fn remote_candidate_info(&self) -> String {
        match self.agent.get_selected_candidate_pair() {
            Some(pair) => pair.remote.marshal(),
            None => String::new(),
        }
    }

    /// Tear the agent down: stops the receive loop and closes the library
    /// agent.
    pub async fn close(&self) {
        if let Some(task) = self.io_task.lock().take() {
            task.abort();
        }
        self.cancel_tx.lock().take();
        if let Err(e) = self.agent.close().await {
            debug!("agent close: {e}");
        }
    }
}

impl Drop for IceAgent {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.lock().take() {
            task.abort();
        }
        let agent = Arc::clone(&self.agent);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = agent.close().await;
            });
        }
    }
}

impl fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceAgent")
            .field("controlling", &self.controlling)
            .field("state", &self.state())
            .finish()
    }
}
