//! RTCM3 Framing
//!
//! Frame layout and the incremental stream parser used for statistics.

pub mod frame;
pub mod parser;

pub use frame::{crc24q, RtcmFrame, PREAMBLE};
pub use parser::{FrameParser, Frames};
