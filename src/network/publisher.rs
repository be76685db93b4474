//! Publisher socket
//!
//! Fans every message out to all connected peers:
//! - Bind mode: listens and accepts any number of subscribers
//! - Connect mode: dials one bound subscriber, queueing while the link is down
//!
//! `send` only enqueues. A background I/O thread owns the sockets, polls
//! them with mio and writes whenever a peer is writable. Each peer has its
//! own queue bounded in messages; a peer at its high-water mark misses new
//! messages until it catches up.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use super::connection::{Connection, OutQueue, PendingDial, ReadStatus};
use super::{BusError, BusOptions, BusSender, Endpoint, Mode};
use crate::protocol::{encode_frame, FRAME_HEADER_SIZE};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const FIRST_PEER_TOKEN: usize = 2;
const EVENTS_CAPACITY: usize = 256;

/// Counters for one publisher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub messages_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub peers_accepted: u64,
}

/// Counters updated by the I/O thread
#[derive(Debug, Default)]
struct SharedStats {
    messages_sent: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    peers_accepted: AtomicU64,
    peers: AtomicUsize,
}

enum Command {
    /// Frames to queue for every peer as one burst
    Frames(Vec<Arc<[u8]>>),
    /// Signal once every queue is empty
    Flush(mpsc::Sender<()>),
    Stop,
}

pub struct Publisher {
    endpoint: Endpoint,
    mode: Mode,
    options: BusOptions,
    commands: mpsc::Sender<Command>,
    waker: Waker,
    stats: Arc<SharedStats>,
    sequence: u64,
    io_thread: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Bind or connect according to `mode`.
    pub fn open(endpoint: &Endpoint, mode: Mode, options: BusOptions) -> Result<Self, BusError> {
        match mode {
            Mode::Bind => Self::bind(endpoint, options),
            Mode::Connect => Self::connect(endpoint, options),
        }
    }

    /// Listen on `endpoint` for subscribers.
    pub fn bind(endpoint: &Endpoint, options: BusOptions) -> Result<Self, BusError> {
        let listener = bind_listener(endpoint)?;
        let local = listener.local_addr()?;
        tracing::info!(endpoint = %endpoint, local = %local, "publisher bound");

        Self::spawn(Endpoint::from(local), Mode::Bind, Some(listener), options)
    }

    /// Dial a subscriber bound on `endpoint`.
    ///
    /// An unreachable endpoint is not an error. Messages queue up to the
    /// high-water mark and go out once the link is established.
    pub fn connect(endpoint: &Endpoint, options: BusOptions) -> Result<Self, BusError> {
        endpoint.resolve()?;
        Self::spawn(endpoint.clone(), Mode::Connect, None, options)
    }

    fn spawn(
        endpoint: Endpoint,
        mode: Mode,
        listener: Option<TcpListener>,
        options: BusOptions,
    ) -> Result<Self, BusError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (commands, inbox) = mpsc::channel();
        let stats = Arc::new(SharedStats::default());

        let io = IoLoop::new(poll, inbox, listener, mode, &endpoint, options.clone(), stats.clone())?;
        let io_thread = std::thread::Builder::new()
            .name("zmqprx-pub-io".to_string())
            .spawn(move || io.run())?;

        Ok(Self {
            endpoint,
            mode,
            options,
            commands,
            waker,
            stats,
            sequence: 0,
            io_thread: Some(io_thread),
        })
    }

    /// Bound address in bind mode, target address in connect mode.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Peers currently connected
    pub fn peer_count(&self) -> usize {
        self.stats.peers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            peers_accepted: self.stats.peers_accepted.load(Ordering::Relaxed),
        }
    }

    /// Wait up to `timeout` for every queued message to be written.
    ///
    /// Returns `true` once all peer queues are empty.
    pub fn flush(&mut self, timeout: Duration) -> Result<bool, BusError> {
        let (done, wait) = mpsc::channel();
        self.command(Command::Flush(done))?;

        match wait.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(?timeout, "output still queued after flush timeout");
                Ok(false)
            }
            Err(RecvTimeoutError::Disconnected) => Err(io_stopped()),
        }
    }

    /// Deliver queued messages for at most the linger period, then close.
    pub fn close(self) -> Result<bool, BusError> {
        let linger = self.options.linger;
        self.close_within(linger)
    }

    /// Close after at most `linger`. Zero discards whatever is still queued.
    pub fn close_within(mut self, linger: Duration) -> Result<bool, BusError> {
        let flushed = self.flush(linger)?;
        self.stop();
        Ok(flushed)
    }

    fn command(&self, command: Command) -> Result<(), BusError> {
        self.commands.send(command).map_err(|_| io_stopped())?;
        self.waker.wake()?;
        Ok(())
    }

    fn stop(&mut self) {
        let Some(handle) = self.io_thread.take() else {
            return;
        };
        let _ = self.commands.send(Command::Stop);
        let _ = self.waker.wake();
        if handle.join().is_err() {
            tracing::error!("publisher I/O thread panicked");
        }
    }
}

impl BusSender for Publisher {
    fn send(&mut self, payload: &[u8]) -> Result<(), BusError> {
        self.send_all(&[payload])
    }

    fn send_all(&mut self, payloads: &[&[u8]]) -> Result<(), BusError> {
        let max = self.options.max_frame_size;
        if let Some(payload) = payloads.iter().find(|p| p.len() > max) {
            return Err(BusError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let mut frames = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
            encode_frame(self.sequence, payload, &mut frame);
            self.sequence += 1;
            frames.push(Arc::<[u8]>::from(frame));
        }

        self.stats
            .messages_sent
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        self.command(Command::Frames(frames))?;

        tracing::trace!(
            next_sequence = self.sequence,
            messages = payloads.len(),
            peers = self.peer_count(),
            "published"
        );
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.io_thread.is_some() {
            let linger = self.options.linger;
            let _ = self.flush(linger);
            self.stop();
        }
    }
}

fn io_stopped() -> BusError {
    BusError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "publisher I/O thread stopped",
    ))
}

/// Accepted subscriber
struct Peer {
    conn: Connection,
    queue: OutQueue,
}

/// Connect-mode link. The queue outlives reconnects.
struct Link {
    target: Endpoint,
    token: Token,
    queue: OutQueue,
    conn: Option<Connection>,
    dial: Option<PendingDial>,
    attempt: usize,
    next_attempt: Option<Instant>,
}

/// Socket side of a publisher, run on its own thread
struct IoLoop {
    poll: Poll,
    events: Events,
    inbox: mpsc::Receiver<Command>,
    listener: Option<TcpListener>,
    peers: HashMap<Token, Peer>,
    link: Option<Link>,
    next_token: usize,
    options: BusOptions,
    stats: Arc<SharedStats>,
    waiters: Vec<mpsc::Sender<()>>,
}

impl IoLoop {
    fn new(
        poll: Poll,
        inbox: mpsc::Receiver<Command>,
        mut listener: Option<TcpListener>,
        mode: Mode,
        endpoint: &Endpoint,
        options: BusOptions,
        stats: Arc<SharedStats>,
    ) -> io::Result<Self> {
        if let Some(listener) = listener.as_mut() {
            poll.registry()
                .register(listener, LISTENER_TOKEN, Interest::READABLE)?;
        }

        let link = (mode == Mode::Connect).then(|| Link {
            target: endpoint.clone(),
            token: Token(FIRST_PEER_TOKEN),
            queue: OutQueue::new(options.send_high_water_mark),
            conn: None,
            dial: None,
            attempt: 0,
            next_attempt: None,
        });

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            inbox,
            listener,
            peers: HashMap::new(),
            link,
            next_token: FIRST_PEER_TOKEN,
            options,
            stats,
            waiters: Vec::new(),
        })
    }

    fn run(mut self) {
        loop {
            if !self.drain_inbox() {
                return;
            }
            self.maintain_link();
            self.write_all();
            self.notify_waiters();

            let timeout = self.next_timeout();
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "publisher poll failed");
                    return;
                }
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                match token {
                    LISTENER_TOKEN => self.accept_pending(),
                    WAKER_TOKEN => {}
                    token if self.link.as_ref().is_some_and(|l| l.token == token) => self.link_event(),
                    token => self.peer_event(token),
                }
            }
        }
    }

    /// Apply queued commands. Returns `false` on stop.
    fn drain_inbox(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(Command::Frames(frames)) => self.enqueue(&frames),
                Ok(Command::Flush(done)) => self.waiters.push(done),
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn enqueue(&mut self, frames: &[Arc<[u8]>]) {
        let burst = frames.len() as u64;

        for peer in self.peers.values_mut() {
            if !peer.queue.push_all(frames) {
                self.stats.frames_dropped.fetch_add(burst, Ordering::Relaxed);
                tracing::debug!(
                    peer = %peer.conn.peer(),
                    dropped = peer.queue.dropped(),
                    "subscriber at high-water mark, message dropped"
                );
            }
        }

        if let Some(link) = self.link.as_mut() {
            if !link.queue.push_all(frames) {
                self.stats.frames_dropped.fetch_add(burst, Ordering::Relaxed);
                tracing::debug!(
                    endpoint = %link.target,
                    dropped = link.queue.dropped(),
                    "link at high-water mark, message dropped"
                );
            }
        }
    }

    fn write_all(&mut self) {
        let mut lost = Vec::new();
        for (token, peer) in self.peers.iter_mut() {
            if peer.queue.is_empty() {
                continue;
            }
            match peer.conn.write_queue(&mut peer.queue) {
                Ok(done) => {
                    self.stats.frames_delivered.fetch_add(done, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::info!(peer = %peer.conn.peer(), error = %e, "subscriber dropped");
                    lost.push(*token);
                }
            }
        }
        for token in lost {
            self.drop_peer(token);
        }

        let mut link_error = None;
        if let Some(link) = self.link.as_mut() {
            if let Some(conn) = link.conn.as_mut() {
                match conn.write_queue(&mut link.queue) {
                    Ok(done) => {
                        self.stats.frames_delivered.fetch_add(done, Ordering::Relaxed);
                    }
                    Err(e) => link_error = Some(e),
                }
            }
        }
        if let Some(e) = link_error {
            self.link_lost(&e.to_string());
        }
    }

    fn notify_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let idle = self.peers.values().all(|p| p.queue.is_empty())
            && self.link.as_ref().map_or(true, |l| l.queue.is_empty());
        if idle {
            for done in self.waiters.drain(..) {
                let _ = done.send(());
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let link = self.link.as_ref()?;
        let wake_at = match (&link.dial, &link.conn) {
            (Some(dial), _) => Some(dial.deadline()),
            (None, None) => link.next_attempt,
            (None, Some(_)) => None,
        };
        wake_at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, addr)) => self.add_peer(stream, addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    return;
                }
            }
        }
    }

    fn add_peer(&mut self, stream: mio::net::TcpStream, addr: SocketAddr) {
        let mut conn = match Connection::new(stream, &self.options) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "failed to set up subscriber");
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self.poll.registry().register(
            conn.stream_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::warn!(peer = %addr, error = %e, "failed to register subscriber");
            return;
        }

        tracing::info!(peer = %addr, "subscriber connected");
        self.peers.insert(
            token,
            Peer {
                conn,
                queue: OutQueue::new(self.options.send_high_water_mark),
            },
        );
        self.stats.peers_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.peers.fetch_add(1, Ordering::Relaxed);
    }

    /// Subscribers never send; reading only detects a closed peer.
    fn peer_event(&mut self, token: Token) {
        let closed = match self.peers.get_mut(&token) {
            Some(peer) => discard_input(&mut peer.conn),
            None => return,
        };
        if closed {
            if let Some(peer) = self.peers.get(&token) {
                tracing::info!(peer = %peer.conn.peer(), "subscriber disconnected");
            }
            self.drop_peer(token);
        }
    }

    fn drop_peer(&mut self, token: Token) {
        if let Some(mut peer) = self.peers.remove(&token) {
            let _ = self.poll.registry().deregister(peer.conn.stream_mut());
            self.stats.peers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn maintain_link(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let now = Instant::now();

        if link.dial.as_ref().is_some_and(|dial| now >= dial.deadline()) {
            if let Some(mut dial) = link.dial.take() {
                tracing::debug!(addr = %dial.addr(), "connect attempt timed out");
                let _ = self.poll.registry().deregister(dial.stream_mut());
            }
            link.next_attempt = Some(now + self.options.reconnect_interval);
        }

        let due = link.next_attempt.map_or(true, |at| now >= at);
        if link.conn.is_some() || link.dial.is_some() || !due {
            return;
        }

        let attempt = link.attempt;
        link.attempt += 1;
        match PendingDial::start(&link.target, attempt) {
            Ok(mut dial) => {
                let token = Token(self.next_token);
                self.next_token += 1;
                match self.poll.registry().register(
                    dial.stream_mut(),
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    Ok(()) => {
                        link.token = token;
                        link.dial = Some(dial);
                        link.next_attempt = None;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to register connect attempt");
                        link.next_attempt = Some(now + self.options.reconnect_interval);
                    }
                }
            }
            Err(e) => {
                tracing::debug!(endpoint = %link.target, error = %e, "subscriber not reachable yet");
                link.next_attempt = Some(now + self.options.reconnect_interval);
            }
        }
    }

    fn link_event(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        if let Some(mut dial) = link.dial.take() {
            match dial.is_connected() {
                Ok(false) => link.dial = Some(dial),
                Ok(true) => match dial.into_connection(&self.options) {
                    Ok(conn) => {
                        tracing::info!(peer = %conn.peer(), "connected to subscriber");
                        link.queue.rewind();
                        link.conn = Some(conn);
                        self.stats.peers_accepted.fetch_add(1, Ordering::Relaxed);
                        self.stats.peers.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "failed to set up link");
                        link.next_attempt = Some(Instant::now() + self.options.reconnect_interval);
                    }
                },
                Err(e) => {
                    tracing::debug!(addr = %dial.addr(), error = %e, "subscriber not reachable yet");
                    let _ = self.poll.registry().deregister(dial.stream_mut());
                    link.next_attempt = Some(Instant::now() + self.options.reconnect_interval);
                }
            }
            return;
        }

        let closed = link.conn.as_mut().is_some_and(discard_input);
        if closed {
            self.link_lost("closed by subscriber");
        }
    }

    fn link_lost(&mut self, reason: &str) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Some(mut conn) = link.conn.take() {
            tracing::info!(peer = %conn.peer(), reason, "subscriber link lost");
            let _ = self.poll.registry().deregister(conn.stream_mut());
            self.stats.peers.fetch_sub(1, Ordering::Relaxed);
        }
        // A partly written frame is resent whole on the next link
        link.queue.rewind();
        link.next_attempt = Some(Instant::now() + self.options.reconnect_interval);
    }
}

/// Drain and discard inbound bytes. Returns `true` once the peer is gone.
fn discard_input(conn: &mut Connection) -> bool {
    loop {
        match conn.fill_read_buffer() {
            Ok(status) => {
                let buffered = conn.readable().len();
                conn.consume(buffered);
                match status {
                    ReadStatus::Open => return false,
                    ReadStatus::Saturated => continue,
                    ReadStatus::Closed => return true,
                }
            }
            Err(_) => return true,
        }
    }
}

/// Bind the first resolved address that accepts.
pub(crate) fn bind_listener(endpoint: &Endpoint) -> Result<TcpListener, BusError> {
    let mut last_error = None;

    for addr in endpoint.resolve()? {
        match bind_one(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }

    Err(BusError::Bind {
        endpoint: endpoint.to_string(),
        source: last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind")
        }),
    })
}

fn bind_one(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameDecoder, DEFAULT_MAX_PAYLOAD};
    use std::io::Read;

    fn local() -> Endpoint {
        "tcp://127.0.0.1:0".parse().unwrap()
    }

    fn connect_to(publisher: &Publisher) -> std::net::TcpStream {
        let addr = format!("127.0.0.1:{}", publisher.endpoint().port());
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_frames(stream: &mut std::net::TcpStream, count: usize) -> Vec<(u64, Vec<u8>)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let mut decoder = FrameDecoder::new(&buf, DEFAULT_MAX_PAYLOAD);
            let mut frames = Vec::new();
            while let Some((h, p)) = decoder.next().unwrap() {
                frames.push((h.sequence, p.to_vec()));
            }
            if frames.len() >= count {
                return frames;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "publisher closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_bind_reports_ephemeral_port() {
        let publisher = Publisher::bind(&local(), BusOptions::default()).unwrap();
        assert_ne!(publisher.endpoint().port(), 0);
        assert_eq!(publisher.mode(), Mode::Bind);
    }

    #[test]
    fn test_bind_conflict_is_an_error() {
        let first = Publisher::bind(&local(), BusOptions::default()).unwrap();
        let taken: Endpoint = first.endpoint().to_string().parse().unwrap();

        assert!(matches!(
            Publisher::bind(&taken, BusOptions::default()),
            Err(BusError::Bind { .. })
        ));
    }

    #[test]
    fn test_fan_out_to_every_subscriber() {
        let mut publisher = Publisher::bind(&local(), BusOptions::default()).unwrap();
        let mut a = connect_to(&publisher);
        let mut b = connect_to(&publisher);
        wait_until("two subscribers", || publisher.peer_count() == 2);

        publisher.send(b"one").unwrap();
        publisher.send(b"two").unwrap();
        assert!(publisher.flush(Duration::from_secs(5)).unwrap());

        for stream in [&mut a, &mut b] {
            let frames = read_frames(stream, 2);
            assert_eq!(frames, vec![(0, b"one".to_vec()), (1, b"two".to_vec())]);
        }
        let stats = publisher.stats();
        assert_eq!(stats.frames_delivered, 4);
        assert_eq!(stats.peers_accepted, 2);
    }

    #[test]
    fn test_send_without_subscribers_is_not_an_error() {
        let mut publisher = Publisher::bind(&local(), BusOptions::default()).unwrap();
        publisher.send(b"into the void").unwrap();
        assert!(publisher.flush(Duration::from_secs(5)).unwrap());
        assert_eq!(publisher.stats().messages_sent, 1);
        assert_eq!(publisher.stats().frames_delivered, 0);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let options = BusOptions {
            max_frame_size: 8,
            ..BusOptions::default()
        };
        let mut publisher = Publisher::bind(&local(), options).unwrap();

        assert!(matches!(
            publisher.send(b"123456789"),
            Err(BusError::PayloadTooLarge { len: 9, max: 8 })
        ));
        assert!(matches!(
            publisher.send_all(&[b"ok", b"123456789"]),
            Err(BusError::PayloadTooLarge { .. })
        ));
        assert_eq!(publisher.stats().messages_sent, 0);
    }

    #[test]
    fn test_connect_mode_queues_until_subscriber_appears() {
        let port = free_port();
        let endpoint = Endpoint::new("127.0.0.1", port);
        let options = BusOptions {
            reconnect_interval: Duration::from_millis(10),
            ..BusOptions::default()
        };

        let mut publisher = Publisher::connect(&endpoint, options).unwrap();
        publisher.send(b"queued").unwrap();
        assert!(!publisher.flush(Duration::from_millis(50)).unwrap());

        let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(read_frames(&mut stream, 1), vec![(0, b"queued".to_vec())]);
        assert!(publisher.close().unwrap());
    }

    #[test]
    fn test_close_gives_up_after_linger() {
        let options = BusOptions {
            linger: Duration::from_millis(50),
            ..BusOptions::default()
        };
        let mut publisher = Publisher::connect(&Endpoint::new("127.0.0.1", free_port()), options).unwrap();
        publisher.send(b"nobody home").unwrap();

        let started = Instant::now();
        assert!(!publisher.close().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_close_within_zero_discards_queue() {
        let mut publisher =
            Publisher::connect(&Endpoint::new("127.0.0.1", free_port()), BusOptions::default()).unwrap();
        publisher.send(b"discarded").unwrap();

        let started = Instant::now();
        assert!(!publisher.close_within(Duration::ZERO).unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_close_delivers_to_slow_reader() {
        let mut publisher = Publisher::bind(&local(), BusOptions::default()).unwrap();
        let mut stream = connect_to(&publisher);
        wait_until("subscriber", || publisher.peer_count() == 1);

        // Far more than the socket buffers hold
        let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        publisher.send(&payload).unwrap();
        publisher.send(b"tail").unwrap();

        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            read_frames(&mut stream, 2)
        });

        assert!(publisher.close().unwrap());
        let frames = reader.join().unwrap();
        assert_eq!(frames[0].1, payload);
        assert_eq!(frames[1].1, b"tail");
    }

    #[test]
    fn test_stalled_subscriber_drops_whole_frames() {
        const SENT: u64 = 200;
        let options = BusOptions {
            send_high_water_mark: 4,
            ..BusOptions::default()
        };
        let mut publisher = Publisher::bind(&local(), options).unwrap();
        let mut stream = connect_to(&publisher);
        wait_until("subscriber", || publisher.peer_count() == 1);

        let payload = vec![0x5Au8; 64 * 1024];
        for _ in 0..SENT {
            publisher.send(&payload).unwrap();
        }
        wait_until("drops", || publisher.stats().frames_dropped > 0);

        let reader = std::thread::spawn(move || {
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).unwrap();
            bytes
        });

        assert!(publisher.flush(Duration::from_secs(5)).unwrap());
        let stats = publisher.stats();
        drop(publisher);

        let bytes = reader.join().unwrap();
        let mut decoder = FrameDecoder::new(&bytes, DEFAULT_MAX_PAYLOAD);
        let mut sequences = Vec::new();
        while let Some((header, body)) = decoder.next().unwrap() {
            assert_eq!(body, payload.as_slice());
            sequences.push(header.sequence);
        }

        assert_eq!(decoder.consumed(), bytes.len(), "trailing partial frame");
        assert_eq!(sequences.len() as u64, stats.frames_delivered);
        assert_eq!(stats.frames_delivered + stats.frames_dropped, SENT);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }
}
