//! flexmidi-core: shared types, wire format, codec and configuration.
//! All other flexmidi crates depend on this one.

pub mod codec;
pub mod config;
pub mod ctrl;
pub mod envelope;
pub mod transport;
pub mod wire;

pub use codec::{CodecError, FlexAssembler, FlexCodec};
pub use envelope::{CommandEnvelope, Fragment, JsonValue, Reply, StreamEnvelope};
pub use transport::{SessionPhase, SessionState, Transport, TransportError, UmpBatch};
pub use wire::Ump128;
