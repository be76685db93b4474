use std::io;

use crate::network::{BusError, EndpointError};
use crate::protocol::{EncodeError, ValueError};

/// Top-level error returned by the run loops and the executables.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    #[error("{0}")]
    Bus(#[from] BusError),

    #[error("{0}")]
    Encode(#[from] EncodeError),

    #[error("{0}")]
    Value(#[from] ValueError),

    #[error("output error: {0}")]
    Output(#[from] io::Error),

    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),
}
