//! Multiplexed TCP tunnel.
//!
//! The client pools a few physical sessions to the server and opens one
//! logical stream per accepted local connection. The server demultiplexes the
//! streams and forwards each one to the configured target.

pub mod buffer;
pub mod client;
pub mod mux;
pub mod pool;
pub mod relay;
pub mod scavenger;
pub mod server;
pub mod shaper;
pub mod transport;
