#![forbid(unsafe_code)]

//! Shared foundation of the rime workspace: the immutable adapter
//! configuration, the common error type, and the one-shot STUN/TURN host
//! resolution performed at daemon startup.

pub mod error;
pub mod options;
pub mod resolve;

pub use error::{Error, Result};
pub use options::AdapterOptions;
pub use resolve::{resolve_ice_servers, IceServers, TurnServer};
