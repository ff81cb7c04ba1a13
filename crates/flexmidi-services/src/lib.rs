//! flexmidi-services: reliability, journaling, request routing, the bridge
//! and the streaming adapter, all layered over a `Transport`.

pub mod bridge;
pub mod handler;
pub mod journal;
pub mod metrics;
pub mod reliability;
pub mod stream;

pub use bridge::FlexBridge;
pub use handler::{DispatchError, IntentRouter, RouteHandler};
pub use journal::{FileJournal, Journal, JournalRole, MemoryJournal};
pub use reliability::{Reliability, ReplayVerdict};
pub use stream::{StreamDelivery, StreamReceiver, StreamSender};
