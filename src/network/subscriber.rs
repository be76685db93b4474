//! Subscriber socket with event-driven I/O
//!
//! Uses mio to multiplex the listener (bind mode) and every peer stream.
//! Frames are decoded as they arrive and queued; `recv_timeout` hands them
//! out one at a time in arrival order.
//!
//! In connect mode the dial is non-blocking and part of the same poll. A
//! lost or refused link is retried every `reconnect_interval`, so a
//! subscriber may start before its publisher.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use super::connection::{Connection, PendingDial, ReadStatus};
use super::publisher::bind_listener;
use super::{BusError, BusOptions, BusReceiver, Endpoint, Mode};
use crate::protocol::{FrameDecoder, FrameError, FrameHeader};

const LISTENER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

/// Why a peer is being dropped
enum PeerFate {
    Keep,
    Closed,
    Failed(io::Error),
    Protocol(FrameError),
}

pub struct Subscriber {
    poll: Poll,
    events: Events,
    endpoint: Endpoint,
    mode: Mode,
    listener: Option<TcpListener>,
    peers: HashMap<Token, Connection>,
    next_token: usize,
    ready: VecDeque<Vec<u8>>,
    options: BusOptions,
    dialing: Option<(Token, PendingDial)>,
    attempt: usize,
    next_attempt: Option<Instant>,
}

impl Subscriber {
    /// Bind or connect according to `mode`.
    pub fn open(endpoint: &Endpoint, mode: Mode, options: BusOptions) -> Result<Self, BusError> {
        match mode {
            Mode::Bind => Self::bind(endpoint, options),
            Mode::Connect => Self::connect(endpoint, options),
        }
    }

    /// Listen on `endpoint`; any number of publishers may connect.
    pub fn bind(endpoint: &Endpoint, options: BusOptions) -> Result<Self, BusError> {
        let mut listener = bind_listener(endpoint)?;
        let local = listener.local_addr()?;

        let mut subscriber = Self::with_parts(Endpoint::from(local), Mode::Bind, options)?;
        subscriber
            .poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        subscriber.listener = Some(listener);

        tracing::info!(endpoint = %endpoint, local = %local, "subscriber bound");
        Ok(subscriber)
    }

    /// Dial the publisher on `endpoint`, retrying while it is unreachable.
    pub fn connect(endpoint: &Endpoint, options: BusOptions) -> Result<Self, BusError> {
        endpoint.resolve()?;
        let mut subscriber = Self::with_parts(endpoint.clone(), Mode::Connect, options)?;
        subscriber.redial_if_due();
        Ok(subscriber)
    }

    fn with_parts(endpoint: Endpoint, mode: Mode, options: BusOptions) -> Result<Self, BusError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            endpoint,
            mode,
            listener: None,
            peers: HashMap::new(),
            next_token: 1,
            ready: VecDeque::new(),
            options,
            dialing: None,
            attempt: 0,
            next_attempt: None,
        })
    }

    /// Bound address in bind mode, target address in connect mode.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn redial_if_due(&mut self) {
        if self.mode != Mode::Connect || !self.peers.is_empty() {
            return;
        }
        let now = Instant::now();

        if let Some((_, dial)) = &self.dialing {
            if now < dial.deadline() {
                return;
            }
            if let Some((_, mut dial)) = self.dialing.take() {
                tracing::debug!(addr = %dial.addr(), "connect attempt timed out");
                let _ = self.poll.registry().deregister(dial.stream_mut());
            }
            self.next_attempt = Some(now + self.options.reconnect_interval);
            return;
        }
        if self.next_attempt.is_some_and(|at| now < at) {
            return;
        }

        let attempt = self.attempt;
        self.attempt += 1;
        let mut dial = match PendingDial::start(&self.endpoint, attempt) {
            Ok(dial) => dial,
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "publisher not reachable yet");
                self.next_attempt = Some(now + self.options.reconnect_interval);
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;
        match self.poll.registry().register(
            dial.stream_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            Ok(()) => {
                self.dialing = Some((token, dial));
                self.next_attempt = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register connect attempt");
                self.next_attempt = Some(now + self.options.reconnect_interval);
            }
        }
    }

    /// Promote the pending dial once the socket reports its outcome.
    fn finish_dial(&mut self) {
        let Some((token, mut dial)) = self.dialing.take() else {
            return;
        };

        let retry_at = Instant::now() + self.options.reconnect_interval;
        match dial.is_connected() {
            Ok(false) => self.dialing = Some((token, dial)),
            Ok(true) => match dial.into_connection(&self.options) {
                Ok(mut conn) => {
                    if let Err(e) = self
                        .poll
                        .registry()
                        .reregister(conn.stream_mut(), token, Interest::READABLE)
                    {
                        tracing::warn!(error = %e, "failed to register publisher link");
                        self.next_attempt = Some(retry_at);
                        return;
                    }
                    tracing::info!(peer = %conn.peer(), "connected to publisher");
                    self.peers.insert(token, conn);
                    self.read_peer(token);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "failed to set up publisher link");
                    self.next_attempt = Some(retry_at);
                }
            },
            Err(e) => {
                tracing::debug!(addr = %dial.addr(), error = %e, "publisher not reachable yet");
                let _ = self.poll.registry().deregister(dial.stream_mut());
                self.next_attempt = Some(retry_at);
            }
        }
    }

    fn register_peer(&mut self, mut conn: Connection) -> io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(conn.stream_mut(), token, Interest::READABLE)?;
        self.peers.insert(token, conn);

        // Data may already be buffered before registration
        self.read_peer(token);
        Ok(())
    }

    fn accept_pending(&mut self) -> io::Result<()> {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return Ok(());
            };

            match listener.accept() {
                Ok((stream, addr)) => match Connection::new(stream, &self.options) {
                    Ok(conn) => {
                        tracing::info!(peer = %addr, "publisher connected");
                        self.register_peer(conn)?;
                    }
                    Err(e) => tracing::warn!(peer = %addr, error = %e, "failed to set up publisher"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    return Ok(());
                }
            }
        }
    }

    /// Drain a readable peer into the ready queue.
    fn read_peer(&mut self, token: Token) {
        let max_payload = self.options.max_frame_size;
        let Some(conn) = self.peers.get_mut(&token) else {
            return;
        };

        let fate = loop {
            let status = match conn.fill_read_buffer() {
                Ok(status) => status,
                Err(e) => break PeerFate::Failed(e),
            };

            let mut decoder = FrameDecoder::new(conn.readable(), max_payload);
            let mut frames = Vec::new();
            let mut protocol_error = None;
            loop {
                match decoder.next() {
                    Ok(Some((header, payload))) => frames.push((header.sequence, payload.to_vec())),
                    Ok(None) => break,
                    Err(e) => {
                        protocol_error = Some(e);
                        break;
                    }
                }
            }
            let consumed = decoder.consumed();
            conn.consume(consumed);

            for (sequence, payload) in frames {
                if let Some(missed) = conn.observe_sequence(sequence) {
                    tracing::debug!(peer = %conn.peer(), missed, "sequence gap");
                }
                self.ready.push_back(payload);
            }

            if let Some(e) = protocol_error {
                break PeerFate::Protocol(e);
            }

            let partial = FrameHeader::parse(conn.readable(), max_payload)
                .ok()
                .flatten()
                .map_or(0, |h| h.total_size());
            conn.expect_frame(partial);

            match status {
                ReadStatus::Open => break PeerFate::Keep,
                ReadStatus::Saturated => continue,
                ReadStatus::Closed => break PeerFate::Closed,
            }
        };

        match fate {
            PeerFate::Keep => {}
            PeerFate::Closed => {
                tracing::info!(peer = %conn.peer(), "publisher disconnected");
                self.drop_peer(token);
            }
            PeerFate::Failed(e) => {
                tracing::warn!(peer = %conn.peer(), error = %e, "read error, dropping publisher");
                self.drop_peer(token);
            }
            PeerFate::Protocol(e) => {
                tracing::warn!(peer = %conn.peer(), error = %e, "protocol error, dropping publisher");
                self.drop_peer(token);
            }
        }
    }

    fn drop_peer(&mut self, token: Token) {
        if let Some(mut conn) = self.peers.remove(&token) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
        }
        if self.mode == Mode::Connect {
            self.next_attempt = Some(Instant::now() + self.options.reconnect_interval);
        }
    }
}

impl BusReceiver for Subscriber {
    fn recv_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, BusError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Ok(Some(payload));
            }

            self.redial_if_due();
            if let Some(payload) = self.ready.pop_front() {
                return Ok(Some(payload));
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Ok(None);
            }

            let mut wait = deadline.map(|d| d - now);
            let wake_at = match &self.dialing {
                Some((_, dial)) => Some(dial.deadline()),
                None => self.next_attempt,
            };
            if let Some(at) = wake_at {
                let until = at.saturating_duration_since(now);
                wait = Some(wait.map_or(until, |w| w.min(until)));
            }

            match self.poll.poll(&mut self.events, wait) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                if token == LISTENER_TOKEN {
                    self.accept_pending()?;
                } else if self.dialing.as_ref().is_some_and(|(t, _)| *t == token) {
                    self.finish_dial();
                } else {
                    self.read_peer(token);
                }
            }
        }
    }
}
