#![forbid(unsafe_code)]

//! GPGNet: the lobby control protocol spoken over TCP to a single local game
//! client.
//!
//! * Tagged-chunk binary framing (`codec`) as a tokio-util codec.
//! * Message model with constructors for the adapter-emitted commands
//!   (`message`).
//! * Single-client TCP server surfacing inbound messages and connection
//!   transitions over a channel (`server`).

pub mod codec;
pub mod message;
pub mod server;

pub use codec::GpgNetCodec;
pub use message::{Chunk, GpgNetMessage, InitMode};
pub use server::{ConnectionState, GpgNetError, GpgNetEvent, GpgNetServer};
