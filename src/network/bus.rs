//! Bus abstraction
//!
//! The run loops only need "send bytes" and "receive bytes". These traits are
//! that seam: the TCP sockets implement them, and so do the in-memory
//! source/sink used to drive loops deterministically.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use super::EndpointError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    #[error("cannot bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("payload of {len} bytes exceeds frame limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("bus i/o error: {0}")]
    Io(#[from] io::Error),

    /// The source has no more messages and never will
    #[error("bus closed")]
    Closed,
}

/// Outbound side of a bus
pub trait BusSender {
    /// Best-effort fan-out of one message to current subscribers.
    fn send(&mut self, payload: &[u8]) -> Result<(), BusError>;

    /// Send messages back to back. A subscriber gets all of them or, when it
    /// is too far behind, none.
    fn send_all(&mut self, payloads: &[&[u8]]) -> Result<(), BusError> {
        for payload in payloads {
            self.send(payload)?;
        }
        Ok(())
    }
}

/// Inbound side of a bus
pub trait BusReceiver {
    /// Next message, or `None` once `timeout` elapses. `None` timeout blocks.
    fn recv_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, BusError>;

    /// Block until the next message.
    fn recv(&mut self) -> Result<Vec<u8>, BusError> {
        loop {
            if let Some(payload) = self.recv_timeout(None)? {
                return Ok(payload);
            }
        }
    }
}

impl<T: BusSender + ?Sized> BusSender for &mut T {
    fn send(&mut self, payload: &[u8]) -> Result<(), BusError> {
        (**self).send(payload)
    }

    fn send_all(&mut self, payloads: &[&[u8]]) -> Result<(), BusError> {
        (**self).send_all(payloads)
    }
}

impl<T: BusReceiver + ?Sized> BusReceiver for &mut T {
    fn recv_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, BusError> {
        (**self).recv_timeout(timeout)
    }
}

/// Finite in-memory source. Reports `Closed` once drained.
#[derive(Debug, Default)]
pub struct MemorySource {
    messages: VecDeque<Vec<u8>>,
}

impl MemorySource {
    pub fn new<I, M>(messages: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        Self {
            messages: messages.into_iter().map(Into::into).collect(),
        }
    }
}

impl BusReceiver for MemorySource {
    fn recv_timeout(&mut self, _timeout: Option<Duration>) -> Result<Option<Vec<u8>>, BusError> {
        self.messages.pop_front().map(Some).ok_or(BusError::Closed)
    }
}

/// In-memory sink recording every message in send order
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Vec<Vec<u8>>,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send once `n` messages have been accepted.
    pub fn failing_after(n: usize) -> Self {
        Self {
            messages: Vec::new(),
            fail_after: Some(n),
        }
    }

    pub fn messages(&self) -> &[Vec<u8>] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Vec<u8>> {
        self.messages
    }
}

impl BusSender for MemorySink {
    fn send(&mut self, payload: &[u8]) -> Result<(), BusError> {
        if self.fail_after.is_some_and(|n| self.messages.len() >= n) {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sink refused message",
            )));
        }
        self.messages.push(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_drains_then_closes() {
        let mut source = MemorySource::new(["a", "b"]);
        assert_eq!(source.recv().unwrap(), b"a");
        assert_eq!(source.recv_timeout(Some(Duration::ZERO)).unwrap(), Some(b"b".to_vec()));
        assert!(matches!(source.recv(), Err(BusError::Closed)));
    }

    #[test]
    fn test_memory_sink_failure_injection() {
        let mut sink = MemorySink::failing_after(1);
        sink.send(b"ok").unwrap();
        assert!(matches!(sink.send(b"nope"), Err(BusError::Io(_))));
        assert_eq!(sink.messages(), &[b"ok".to_vec()]);
    }

    #[test]
    fn test_sender_through_mut_ref() {
        fn push_two<S: BusSender>(mut sink: S) {
            sink.send(b"1").unwrap();
            sink.send(b"2").unwrap();
        }

        let mut sink = MemorySink::new();
        push_two(&mut sink);
        assert_eq!(sink.into_messages(), vec![b"1".to_vec(), b"2".to_vec()]);
    }
}
