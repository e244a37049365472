//! Network layer
//!
//! - [`reactor`]: edge-triggered event loop over `mio`
//! - [`connection`]: per-client socket, buffers and TLS

pub mod connection;
pub mod reactor;

pub use connection::{Accepted, Connection, ConnectionContext};
pub use reactor::{EventHandler, Interest, Reactor, Readiness, StopHandle};
