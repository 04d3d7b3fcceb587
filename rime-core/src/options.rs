use serde::Serialize;

/// Immutable daemon configuration, fixed at startup.
///
/// Field names match the command-line options one to one; the whole struct is
/// echoed back under `options` in the `status` RPC result.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterOptions {
    /// Id of the local player as assigned by the signaling service.
    pub player_id: i64,
    /// Login of the local player.
    pub player_login: String,
    /// TCP port of the JSON-RPC control plane.
    pub rpc_port: u16,
    /// TCP port the game connects to for GPGNet control traffic.
    pub gpgnet_port: u16,
    /// UDP port the game itself listens on for inbound peer traffic.
    pub game_udp_port: u16,
    /// STUN server host name or IP literal.
    pub stun_host: String,
    /// TURN server host name or IP literal.
    pub turn_host: String,
    /// TURN long-term credential user name.
    pub turn_user: String,
    /// TURN long-term credential password.
    pub turn_pass: String,
    /// Log file path; empty means stderr only.
    pub log_file: String,
}

impl AdapterOptions {
    /// Options for loopback tests: every listener on an OS-assigned port,
    /// traversal servers pointed at localhost.
    pub fn for_tests(player_id: i64, player_login: &str) -> Self {
        Self {
            player_id,
            player_login: player_login.to_string(),
            rpc_port: 0,
            gpgnet_port: 0,
            game_udp_port: 53211,
            stun_host: "127.0.0.1".to_string(),
            turn_host: "127.0.0.1".to_string(),
            turn_user: "rime".to_string(),
            turn_pass: "rime".to_string(),
            log_file: String::new(),
        }
    }
}
