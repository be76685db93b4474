//! Bridge between two buses
//!
//! Every inbound payload is forwarded unmodified, then followed by the
//! sentinel. Payloads are never parsed.

use std::io::Write;

use super::{LoopStats, Shutdown, StatsReporter, RECV_TICK};
use crate::network::{BusError, BusReceiver, BusSender};
use crate::Error;

/// Sent after every forwarded message
pub const SENTINEL: &[u8] = b"invalid message";

pub struct Relay<W: Write> {
    diagnostic: W,
    stats: LoopStats,
}

impl<W: Write> Relay<W> {
    /// `diagnostic` receives each payload as (lossy) UTF-8 text.
    pub fn new(diagnostic: W) -> Self {
        Self {
            diagnostic,
            stats: LoopStats::default(),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn into_diagnostic(self) -> W {
        self.diagnostic
    }

    /// Echo, then forward the payload and the sentinel as one burst. A failed
    /// send is fatal; a failed diagnostic write is not.
    pub fn forward<S: BusSender>(&mut self, payload: &[u8], mut tx: S) -> Result<(), Error> {
        self.stats.received += 1;

        if let Err(e) = self.echo(payload) {
            tracing::warn!(error = %e, "diagnostic output failed");
        }

        tx.send_all(&[payload, SENTINEL])?;
        self.stats.handled += 1;
        tracing::trace!(bytes = payload.len(), "forwarded");
        Ok(())
    }

    fn echo(&mut self, payload: &[u8]) -> std::io::Result<()> {
        writeln!(self.diagnostic, "{}", String::from_utf8_lossy(payload))?;
        self.diagnostic.flush()
    }

    /// Run until `shutdown` fires or the source closes.
    pub fn run<R, S>(&mut self, mut rx: R, mut tx: S, shutdown: &Shutdown) -> Result<LoopStats, Error>
    where
        R: BusReceiver,
        S: BusSender,
    {
        let mut reporter = StatsReporter::new("relay");

        while !shutdown.is_triggered() {
            match rx.recv_timeout(Some(RECV_TICK)) {
                Ok(Some(payload)) => self.forward(&payload, &mut tx)?,
                Ok(None) => {}
                Err(BusError::Closed) => {
                    tracing::debug!("source closed");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            reporter.tick(&self.stats);
        }

        reporter.report(&self.stats);
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MemorySink, MemorySource};

    #[test]
    fn test_ping_scenario() {
        let mut relay = Relay::new(Vec::new());
        let mut sink = MemorySink::new();

        relay
            .run(MemorySource::new(["ping"]), &mut sink, &Shutdown::new())
            .unwrap();

        assert_eq!(sink.into_messages(), vec![b"ping".to_vec(), SENTINEL.to_vec()]);
        assert_eq!(relay.into_diagnostic(), b"ping\n");
    }

    #[test]
    fn test_pairs_follow_inbound_order() {
        let inbound: Vec<Vec<u8>> = (0..50).map(|i| format!("msg-{i}").into_bytes()).collect();
        let mut relay = Relay::new(std::io::sink());
        let mut sink = MemorySink::new();

        let stats = relay
            .run(MemorySource::new(inbound.clone()), &mut sink, &Shutdown::new())
            .unwrap();

        let out = sink.into_messages();
        assert_eq!(out.len(), 2 * inbound.len());
        for (i, pair) in out.chunks(2).enumerate() {
            assert_eq!(pair[0], inbound[i]);
            assert_eq!(pair[1], SENTINEL);
        }
        assert_eq!(stats.handled, 50);
    }

    #[test]
    fn test_binary_payload_forwarded_unmodified() {
        let payload = vec![0xff, 0xfe, 0x00, 0x41];
        let mut relay = Relay::new(Vec::new());
        let mut sink = MemorySink::new();

        relay.forward(&payload, &mut sink).unwrap();

        assert_eq!(sink.messages()[0], payload);
        assert_eq!(relay.into_diagnostic(), "\u{fffd}\u{fffd}\u{0}A\n".as_bytes());
    }

    #[test]
    fn test_send_failure_is_fatal() {
        let mut relay = Relay::new(std::io::sink());
        let mut sink = MemorySink::failing_after(3);

        let result = relay.run(MemorySource::new(["a", "b", "c"]), &mut sink, &Shutdown::new());

        assert!(matches!(result, Err(Error::Bus(BusError::Io(_)))));
        // First pair complete, second cut after the forward
        assert_eq!(
            sink.into_messages(),
            vec![b"a".to_vec(), SENTINEL.to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn test_diagnostic_failure_is_ignored() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut relay = Relay::new(Broken);
        let mut sink = MemorySink::new();
        relay.forward(b"still sent", &mut sink).unwrap();
        assert_eq!(sink.messages().len(), 2);
    }
}
