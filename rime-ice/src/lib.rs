#![forbid(unsafe_code)]

//! NAT traversal for the adapter: a lifecycle wrapper around the `webrtc-ice`
//! agent (`agent`) and the per-peer coupling of that agent with a loopback
//! UDP socket that makes a remote peer look local to the game (`relay`).

pub mod agent;
pub mod relay;

pub use agent::{AgentState, IceAgent, IceError, Result};
pub use relay::{PeerLink, PeerRelay};
