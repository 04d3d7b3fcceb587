use thiserror::Error;

/// Errors surfaced to the RPC client as the JSON-RPC error message.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("joinGame/hostGame may only be called once per game connection session; wait for the game to disconnect")]
    DuplicateSessionCommand,
    #[error("no relay for remote peer {0} found; call joinGame() or connectToPeer() first")]
    UnknownPeer(i64),
    #[error("relay for remote peer {0} already exists")]
    DuplicateRelay(i64),
    #[error("{0}")]
    InvalidArity(&'static str),
    #[error("bind: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    GpgNet(#[from] rime_gpgnet::GpgNetError),
    #[error(transparent)]
    Ice(#[from] rime_ice::IceError),
}
