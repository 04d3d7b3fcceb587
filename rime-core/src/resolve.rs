//! One-shot resolution of the configured STUN and TURN hosts.
//!
//! The daemon refuses to start without usable traversal servers, so failure
//! here is fatal. Results are cached for the process lifetime; nothing else
//! in the adapter touches DNS.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::TokioAsyncResolver;
use tracing::info;

use crate::{AdapterOptions, Error, Result};

/// Default STUN/TURN port when the configured host carries none.
const ICE_PORT: u16 = 3478;

/// TURN endpoint with long-term credentials.
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
}

/// Traversal servers resolved once at startup.
///
/// Both entries are optional so that tests can run agents with host
/// candidates only; the daemon always fills both.
#[derive(Debug, Clone, Default)]
pub struct IceServers {
    pub stun: Option<SocketAddr>,
    pub turn: Option<TurnServer>,
}

/// Resolve the configured STUN and TURN hosts into cached socket addresses.
pub async fn resolve_ice_servers(opts: &AdapterOptions) -> Result<IceServers> {
    let stun = resolve_host(&opts.stun_host).await?;
    let turn = resolve_host(&opts.turn_host).await?;
    info!(%stun, %turn, "resolved traversal servers");
    Ok(IceServers {
        stun: Some(stun),
        turn: Some(TurnServer {
            addr: turn,
            username: opts.turn_user.clone(),
            password: opts.turn_pass.clone(),
        }),
    })
}

/// Resolve one host name to a socket address on the default traversal port.
/// IP literals short-circuit the resolver.
pub async fn resolve_host(host: &str) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, ICE_PORT));
    }
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| Error::resolve(format!("resolver init: {e}")))?;
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| Error::resolve(format!("{host}: {e}")))?;
    let ip = lookup
        .iter()
        .next()
        .ok_or_else(|| Error::resolve(format!("{host}: no addresses")))?;
    Ok(SocketAddr::new(ip, ICE_PORT))
}
