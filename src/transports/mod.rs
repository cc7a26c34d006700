//! Concrete [`Transport`](crate::transport::Transport) implementations.
//!
//! The datagram backend used in production builds is supplied by the
//! embedding application; this crate ships the in-process
//! [`MemoryTransport`] used by the integration tests and for local
//! single-machine play.

#[cfg(feature = "transport-memory")]
pub mod memory;

#[cfg(feature = "transport-memory")]
pub use memory::{MemoryNetwork, MemoryTransport};
