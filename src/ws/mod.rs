//! The real-time core: envelope protocol, connection registry, and the
//! per-connection pump pair.

pub mod client;
pub mod envelope;
pub mod handler;
pub mod hub;
