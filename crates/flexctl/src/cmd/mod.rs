//! CLI command modules.

pub mod client;
pub mod journal;
pub mod request;
