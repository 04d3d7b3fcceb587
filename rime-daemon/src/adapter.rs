//! The coordinator. Owns the relay registry, the deferred host/join task and
//! the cached game state; wires RPC methods to actions and translates GPGNet
//! and ICE events into RPC notifications.
//!
//! Everything mutable lives inside one task driving a `select!` loop over the
//! three event sources, so session state needs no locking and events are
//! processed to completion in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rime_core::{AdapterOptions, IceServers};
use rime_gpgnet::{Chunk, ConnectionState, GpgNetEvent, GpgNetMessage, GpgNetServer, InitMode};
use rime_ice::{AgentState, IceError, PeerRelay};
use rime_rpc::{RpcCall, RpcServer};

use crate::error::AdapterError;

/// Deferred lobby command. `hostGame`/`joinGame` park the session here until
/// the game reports `"Lobby"`; only then is the command sent and the task
/// advanced, so a command issued too early is deferred rather than lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    NoTask,
    ShouldHostGame,
    SentHostGame,
    ShouldJoinGame,
    SentJoinGame,
}

/// Events from the per-relay ICE callbacks, keyed by remote player id. The
/// id is deliberately the only back-reference: the coordinator re-looks the
/// relay up and treats a miss as a benign late event.
#[derive(Debug)]
enum IceEvent {
    SdpGathered { peer: i64, sdp64: String },
    StateChanged { peer: i64, state: AgentState },
}

pub struct IceAdapter {
    opts: Arc<AdapterOptions>,
    servers: IceServers,
    rpc: RpcServer,
    rpc_calls: mpsc::UnboundedReceiver<RpcCall>,
    gpgnet: GpgNetServer,
    gpgnet_events: mpsc::UnboundedReceiver<GpgNetEvent>,
    ice_tx: mpsc::UnboundedSender<IceEvent>,
    ice_events: mpsc::UnboundedReceiver<IceEvent>,

    relays: HashMap<i64, PeerRelay>,
    task: TaskState,
    game_state: String,
    game_connected: bool,
    host_game_map: Option<String>,
    join_game: Option<(String, i64)>,
}

impl IceAdapter {
    /// Bind both listeners and assemble the coordinator.
    pub async fn bind(opts: AdapterOptions, servers: IceServers) -> std::io::Result<Self> {
        let (rpc, rpc_calls) = RpcServer::bind(opts.rpc_port).await?;
        let (gpgnet, gpgnet_events) = GpgNetServer::bind(opts.gpgnet_port).await?;
        let (ice_tx, ice_events) = mpsc::unbounded_channel();
        info!(
            rpc = rpc.local_addr().port(),
            gpgnet = gpgnet.local_addr().port(),
            player = opts.player_id,
            "ice adapter up"
        );
        Ok(Self {
            opts: Arc::new(opts),
            servers,
            rpc,
            rpc_calls,
            gpgnet,
            gpgnet_events,
            ice_tx,
            ice_events,
            relays: HashMap::new(),
            task: TaskState::NoTask,
            game_state: String::new(),
            game_connected: false,
            host_game_map: None,
            join_game: None,
        })
    }

    /// Actual RPC listener port (relevant when configured as 0).
    pub fn rpc_port(&self) -> u16 {
        self.rpc.local_addr().port()
    }

    /// Actual GPGNet listener port (relevant when configured as 0).
    pub fn gpgnet_port(&self) -> u16 {
        self.gpgnet.local_addr().port()
    }

    /// Drive the adapter until a `quit` request arrives.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                Some(call) = self.rpc_calls.recv() => {
                    if self.handle_rpc(call).await {
                        break;
                    }
                }
                Some(event) = self.gpgnet_events.recv() => {
                    self.handle_gpgnet(event).await;
                }
                Some(event) = self.ice_events.recv() => {
                    self.handle_ice(event);
                }
                else => break,
            }
        }
        info!("coordinator loop ended");
    }

    /// Returns true when the call was `quit`.
    async fn handle_rpc(&mut self, call: RpcCall) -> bool {
        let RpcCall {
            method,
            params,
            responder,
        } = call;
        debug!(%method, "rpc call");

        let mut quit = false;
        let result: Result<Value, String> = match method.as_str() {
            "quit" => {
                quit = true;
                Ok(json!("ok"))
            }
            "hostGame" => self
                .rpc_host_game(&params)
                .await
                .map(|_| json!("ok"))
                .map_err(|e| e.to_string()),
            "joinGame" => self
                .rpc_join_game(&params)
                .await
                .map(|_| json!("ok"))
                .map_err(|e| e.to_string()),
            "connectToPeer" => self
                .rpc_connect_to_peer(&params)
                .await
                .map(|_| json!("ok"))
                .map_err(|e| e.to_string()),
            "disconnectFromPeer" => self
                .rpc_disconnect_from_peer(&params)
                .map(|_| json!("ok"))
                .map_err(|e| e.to_string()),
            "setSdp" => self
                .rpc_set_sdp(&params)
                .await
                .map(|_| json!("ok"))
                .map_err(|e| e.to_string()),
            "sendToGpgNet" => self
                .rpc_send_to_gpgnet(&params)
                .map(|_| json!("ok"))
                .map_err(|e| e.to_string()),
            "status" => Ok(self.status().await),
            other => Err(format!("unknown method: {other}")),
        };

        let _ = responder.send(result);
        if quit {
            // Give the connection writer a chance to flush the response
            // before the process tears everything down.
            tokio::time::sleep(Duration::from_millis(100)).await;
            info!("quit requested");
        }
        quit
    }

    async fn rpc_host_game(&mut self, params: &[Value]) -> Result<(), AdapterError> {
        let map = params
            .first()
            .and_then(Value::as_str)
            .ok_or(AdapterError::InvalidArity("Need 1 parameter: mapName (string)"))?;
        if self.task != TaskState::NoTask {
            return Err(AdapterError::DuplicateSessionCommand);
        }
        self.host_game_map = Some(map.to_string());
        self.task = TaskState::ShouldHostGame;
        self.try_execute_task().await
    }

    async fn rpc_join_game(&mut self, params: &[Value]) -> Result<(), AdapterError> {
        let (login, id) = peer_params(params)?;
        if self.task != TaskState::NoTask {
            return Err(AdapterError::DuplicateSessionCommand);
        }
        self.join_game = Some((login, id));
        self.task = TaskState::ShouldJoinGame;
        self.try_execute_task().await
    }

    async fn rpc_connect_to_peer(&mut self, params: &[Value]) -> Result<(), AdapterError> {
        let (login, id) = peer_params(params)?;
        let port = self.create_relay(id, &login).await?;
        self.gpgnet
            .send_connect_to_peer(&format!("127.0.0.1:{port}"), &login, id)?;
        Ok(())
    }

    fn rpc_disconnect_from_peer(&mut self, params: &[Value]) -> Result<(), AdapterError> {
        let id = params
            .first()
            .and_then(Value::as_i64)
            .ok_or(AdapterError::InvalidArity(
                "Need 1 parameters: remotePlayerId (int)",
            ))?;
        if !self.relays.contains_key(&id) {
            return Err(AdapterError::UnknownPeer(id));
        }
        self.gpgnet.send_disconnect_from_peer(id)?;
        // Dropping the relay tears down its socket and agent with it.
        self.relays.remove(&id);
        info!(peer = id, "relay removed");
        Ok(())
    }

    async fn rpc_set_sdp(&mut self, params: &[Value]) -> Result<(), AdapterError> {
        let id = params.first().and_then(Value::as_i64);
        let sdp64 = params.get(1).and_then(Value::as_str);
        let (Some(id), Some(sdp64)) = (id, sdp64) else {
            return Err(AdapterError::InvalidArity(
                "Need 2 parameters: remotePlayerId (int), sdp64 (string)",
            ));
        };
        let relay = self
            .relays
            .get(&id)
            .ok_or(AdapterError::UnknownPeer(id))?;
        relay.agent().set_remote_sdp(sdp64).await?;
        Ok(())
    }

    fn rpc_send_to_gpgnet(&mut self, params: &[Value]) -> Result<(), AdapterError> {
        let header = params.first().and_then(Value::as_str);
        let chunks = params.get(1).and_then(Value::as_array);
        let (Some(header), Some(chunks)) = (header, chunks) else {
            return Err(AdapterError::InvalidArity(
                "Need 2 parameters: header (string), chunks (array)",
            ));
        };
        let chunks = chunks
            .iter()
            .map(Chunk::from_json)
            .collect::<Option<Vec<_>>>()
            .ok_or(AdapterError::InvalidArity(
                "chunks may only contain integers and strings",
            ))?;
        self.gpgnet.send(GpgNetMessage::new(header, chunks))?;
        Ok(())
    }

    async fn status(&self) -> Value {
        let mut gpgnet = json!({
            "local_port": self.gpgnet.local_addr().port(),
            "connected": self.game_connected,
            "game_state": self.game_state,
        });
        if let Some(map) = &self.host_game_map {
            gpgnet["host_game"] = json!({ "map": map });
        } else if let Some((login, id)) = &self.join_game {
            gpgnet["join_game"] = json!({
                "remote_player_login": login,
                "remote_player_id": id,
            });
        }

        let mut ids: Vec<i64> = self.relays.keys().copied().collect();
        ids.sort_unstable();
        let mut relays = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(relay) = self.relays.get(&id) else {
                continue;
            };
            let agent = relay.agent();
            relays.push(json!({
                "remote_player_id": id,
                "remote_player_login": relay.peer_login(),
                "local_game_udp_port": relay.local_game_udp_port(),
                "ice_agent": {
                    "state": agent.state().as_str(),
                    "connected": agent.is_connected(),
                    "local_candidate": agent.local_candidate_info().await,
                    "remote_candidate": agent.remote_candidate_info().await,
                    "local_sdp": agent.local_sdp(),
                    "local_sdp64": agent.local_sdp64(),
                    "remote_sdp64": agent.remote_sdp64(),
                },
            }));
        }

        json!({
            "options": &*self.opts,
            "gpgnet": gpgnet,
            "relays": relays,
        })
    }

    async fn handle_gpgnet(&mut self, event: GpgNetEvent) {
        match event {
            GpgNetEvent::Message(msg) => {
                if msg.header == "GameState" {
                    if let Some(Chunk::Str(state)) = msg.chunks.first() {
                        self.game_state = state.clone();
                        info!(state = %self.game_state, "game state");
                        if self.game_state == "Idle" {
                            if let Err(e) = self.gpgnet.send_create_lobby(
                                InitMode::NormalLobby,
                                self.opts.game_udp_port,
                                &self.opts.player_login,
                                self.opts.player_id,
                                1,
                            ) {
                                warn!("create lobby failed: {e}");
                            }
                        }
                        if let Err(e) = self.try_execute_task().await {
                            warn!("deferred task failed: {e}");
                        }
                    }
                }
                let chunks: Vec<Value> = msg.chunks.iter().map(Chunk::to_json).collect();
                self.rpc.notify(
                    "onGpgNetMessageReceived",
                    vec![json!(msg.header), Value::Array(chunks)],
                );
            }
            GpgNetEvent::Connection(ConnectionState::Connected) => {
                self.game_connected = true;
                self.rpc
                    .notify("onConnectionStateChanged", vec![json!("Connected")]);
            }
            GpgNetEvent::Connection(ConnectionState::Disconnected) => {
                self.game_connected = false;
                self.rpc
                    .notify("onConnectionStateChanged", vec![json!("Disconnected")]);
                info!("game disconnected, resetting session");
                self.reset_session();
            }
            GpgNetEvent::Connection(ConnectionState::Listening) => {
                debug!("gpgnet listening");
            }
        }
    }

    fn handle_ice(&mut self, event: IceEvent) {
        match event {
            IceEvent::SdpGathered { peer, sdp64 } => {
                if !self.relays.contains_key(&peer) {
                    debug!(peer, "sdp for unknown relay, dropping");
                    return;
                }
                self.rpc.notify(
                    "onSdpGathered",
                    vec![json!(self.opts.player_id), json!(peer), json!(sdp64)],
                );
            }
            IceEvent::StateChanged { peer, state } => {
                if !self.relays.contains_key(&peer) {
                    debug!(peer, "state change for unknown relay, dropping");
                    return;
                }
                self.rpc.notify(
                    "onPeerStateChanged",
                    vec![
                        json!(self.opts.player_id),
                        json!(peer),
                        json!(state.as_str()),
                    ],
                );
            }
        }
    }

    /// Fire the deferred host/join command once the game is in the lobby;
    /// until then the task stays parked in its `Should*` state.
    async fn try_execute_task(&mut self) -> Result<(), AdapterError> {
        if self.game_state != "Lobby" {
            return Ok(());
        }
        match self.task {
            TaskState::ShouldHostGame => {
                let map = self.host_game_map.clone().unwrap_or_default();
                self.gpgnet.send_host_game(&map)?;
                self.task = TaskState::SentHostGame;
            }
            TaskState::ShouldJoinGame => {
                let Some((login, id)) = self.join_game.clone() else {
                    return Ok(());
                };
                let port = self.create_relay(id, &login).await?;
                self.gpgnet
                    .send_join_game(&format!("127.0.0.1:{port}"), &login, id)?;
                self.task = TaskState::SentJoinGame;
            }
            _ => {}
        }
        Ok(())
    }

    /// Allocate a relay for `peer`, announce the SDP need to the RPC client,
    /// and start candidate gathering. Returns the loopback port.
    async fn create_relay(&mut self, peer: i64, login: &str) -> Result<u16, AdapterError> {
        if self.relays.contains_key(&peer) {
            return Err(AdapterError::DuplicateRelay(peer));
        }
        let controlling = self.opts.player_id < peer;
        let relay = PeerRelay::bind(
            peer,
            login,
            self.opts.game_udp_port,
            &self.servers,
            controlling,
        )
        .await
        .map_err(|e| match e {
            IceError::Io(io) => AdapterError::Bind(io),
            other => AdapterError::Ice(other),
        })?;
        let port = relay.port();

        self.rpc.notify(
            "onNeedSdp",
            vec![json!(self.opts.player_id), json!(peer)],
        );

        let tx = self.ice_tx.clone();
        relay.set_ice_state_callback(move |state| {
            let _ = tx.send(IceEvent::StateChanged { peer, state });
        });
        let tx = self.ice_tx.clone();
        relay
            .gather_candidates(move |sdp64| {
                let _ = tx.send(IceEvent::SdpGathered { peer, sdp64 });
            })
            .await?;

        self.relays.insert(peer, relay);
        Ok(port)
    }

    /// Everything session-scoped dies with the game connection.
    fn reset_session(&mut self) {
        self.relays.clear();
        self.host_game_map = None;
        self.join_game = None;
        self.game_state.clear();
        self.task = TaskState::NoTask;
    }
}

fn peer_params(params: &[Value]) -> Result<(String, i64), AdapterError> {
    let login = params.first().and_then(Value::as_str);
    let id = params.get(1).and_then(Value::as_i64);
    match (login, id) {
        (Some(login), Some(id)) => Ok((login.to_string(), id)),
        _ => Err(AdapterError::InvalidArity(
            "Need 2 parameters: remotePlayerLogin (string), remotePlayerId (int)",
        )),
    }
}
