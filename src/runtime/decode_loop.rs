//! Subscriber-side loop: decode each inbound record and render it

use std::io::Write;

use super::{LoopStats, Shutdown, StatsReporter, RECV_TICK};
use crate::network::{BusError, BusReceiver};
use crate::protocol::{decode_message, WireFormat};
use crate::Error;

pub struct DecodeLoop<W: Write> {
    format: WireFormat,
    out: W,
    stats: LoopStats,
}

impl<W: Write> DecodeLoop<W> {
    pub fn new(format: WireFormat, out: W) -> Self {
        Self {
            format,
            out,
            stats: LoopStats::default(),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Decode and render one payload.
    ///
    /// Returns `false` when the payload was skipped as undecodable. Only a
    /// failing output stream is an error.
    pub fn handle(&mut self, payload: &[u8]) -> Result<bool, Error> {
        self.stats.received += 1;

        let message = match decode_message(payload, self.format) {
            Ok(message) => message,
            Err(e) => {
                self.stats.skipped += 1;
                tracing::debug!(error = %e, bytes = payload.len(), "skipping undecodable message");
                return Ok(false);
            }
        };

        message.render(&mut self.out)?;
        self.out.flush()?;
        self.stats.handled += 1;
        Ok(true)
    }

    /// Run until `shutdown` fires or the source closes.
    pub fn run<R: BusReceiver>(&mut self, mut rx: R, shutdown: &Shutdown) -> Result<LoopStats, Error> {
        let mut reporter = StatsReporter::new("decoder");

        while !shutdown.is_triggered() {
            match rx.recv_timeout(Some(RECV_TICK)) {
                Ok(Some(payload)) => {
                    self.handle(&payload)?;
                }
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
