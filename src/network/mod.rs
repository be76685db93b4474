//! Network layer: a small pub/sub bus over TCP
//!
//! Uses mio for non-blocking I/O (epoll/kqueue).
//!
//! - Publisher fans each message out to every connected subscriber
//! - Subscriber multiplexes any number of publishers
//! - Either side may bind or connect
//!
//! Messages travel as length-prefixed frames, see `protocol::frame`.

mod bus;
mod connection;
mod endpoint;
mod options;
mod publisher;
mod subscriber;

pub use bus::{BusError, BusReceiver, BusSender, MemorySink, MemorySource};
pub use connection::{Connection, OutQueue, PendingDial, ReadStatus};
pub use endpoint::{Endpoint, EndpointError, Mode};
pub use options::BusOptions;
pub use publisher::{Publisher, PublisherStats};
pub use subscriber::Subscriber;
