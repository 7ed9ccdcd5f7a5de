//! NTRIP Protocol Implementation
//!
//! Request/response heads for both sides of the relay: the client handshake
//! against the upstream caster and the server handshake with local clients.

pub mod constants;
pub mod handler;
pub mod types;

pub use constants::*;
pub use handler::{basic_credentials, build_request, decode_basic_credentials, NtripHandler};
pub use types::*;
