//! GPGNet message model: a header string followed by typed chunks.

use serde_json::Value;

/// Lobby initialization mode carried in `CreateLobby`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    NormalLobby,
    AutoLobby,
}

impl InitMode {
    /// Wire value of the mode.
    pub fn as_i32(self) -> i32 {
        match self {
            InitMode::NormalLobby => 0,
            InitMode::AutoLobby => 1,
        }
    }
}

/// One typed payload chunk of a GPGNet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Int(i32),
    Str(String),
}

impl Chunk {
    /// JSON view used on the RPC plane (`onGpgNetMessageReceived`, `sendToGpgNet`).
    pub fn to_json(&self) -> Value {
        match self {
            Chunk::Int(v) => Value::from(*v),
            Chunk::Str(s) => Value::from(s.clone()),
        }
    }

    /// Parse a JSON value coming from the RPC plane. Only integers that fit
    /// an i32 and strings are representable on the wire.
    pub fn from_json(value: &Value) -> Option<Chunk> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Chunk::Int),
            Value::String(s) => Some(Chunk::Str(s.clone())),
            _ => None,
        }
    }
}

impl From<i32> for Chunk {
    fn from(v: i32) -> Self {
        Chunk::Int(v)
    }
}

impl From<&str> for Chunk {
    fn from(v: &str) -> Self {
        Chunk::Str(v.to_string())
    }
}

impl From<String> for Chunk {
    fn from(v: String) -> Self {
        Chunk::Str(v)
    }
}

/// A GPGNet control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpgNetMessage {
    pub header: String,
    pub chunks: Vec<Chunk>,
}

impl GpgNetMessage {
    pub fn new(header: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        Self {
            header: header.into(),
            chunks,
        }
    }

    /// `CreateLobby(initMode, udpPort, login, playerId, natTraversal)` — sent
    /// whenever the game reports `GameState "Idle"`.
    pub fn create_lobby(
        init_mode: InitMode,
        udp_port: u16,
        login: &str,
        player_id: i64,
        nat_traversal: i32,
    ) -> Self {
        Self::new(
            "CreateLobby",
            vec![
                Chunk::Int(init_mode.as_i32()),
                Chunk::Int(i32::from(udp_port)),
                Chunk::from(login),
                Chunk::Int(player_id as i32),
                Chunk::Int(nat_traversal),
            ],
        )
    }

    pub fn host_game(map: &str) -> Self {
        Self::new("HostGame", vec![Chunk::from(map)])
    }

    pub fn join_game(addr: &str, login: &str, player_id: i64) -> Self {
        Self::new(
            "JoinGame",
            vec![Chunk::from(addr), Chunk::from(login), Chunk::Int(player_id as i32)],
        )
    }

    pub fn connect_to_peer(addr: &str, login: &str, player_id: i64) -> Self {
        Self::new(
            "ConnectToPeer",
            vec![Chunk::from(addr), Chunk::from(login), Chunk::Int(player_id as i32)],
        )
    }

    pub fn disconnect_from_peer(player_id: i64) -> Self {
        Self::new("DisconnectFromPeer", vec![Chunk::Int(player_id as i32)])
    }
}
