//! flexmidi-transport: the two `Transport` implementations.
//!
//! `RtpMidiSession` carries UMP frames over UDP with discovery and
//! capability negotiation; `LoopbackTransport` wires endpoints inside one
//! process.

pub mod discovery;
pub mod frame;
pub mod loopback;
pub mod session;

pub use frame::FramePacker;
pub use loopback::LoopbackTransport;
pub use session::{RtpMidiSession, SessionOptions};
