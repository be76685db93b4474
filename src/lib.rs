//! zmqprx - typed JSON records over a pub/sub bus
//!
//! Architecture:
//! - Protocol: typed-value convention (prefixed or tagged JSON) + bus framing
//! - Network: TCP publisher/subscriber sockets multiplexed with mio
//! - Runtime: decode loop, relay loop, shutdown token
//!
//! The three executables under `src/bin` are thin shells around these
//! modules.

pub mod cli;
pub mod error;
pub mod network;
pub mod protocol;
pub mod runtime;

pub use error::Error;
