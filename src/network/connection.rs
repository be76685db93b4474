//! Buffered peer connection
//!
//! Wraps a non-blocking mio `TcpStream` with a growable read buffer (frames
//! can be large). Outbound frames wait in an `OutQueue`, bounded in
//! messages; the publisher keeps one queue per peer.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use super::{BusError, BusOptions, Endpoint};

/// Initial read buffer size
const READ_BUFFER_SIZE: usize = 64 * 1024;
/// Stop reading once this much is buffered and let the caller drain it
pub(crate) const READ_SATURATION: usize = 4 * 1024 * 1024;
/// Upper bound on a single connection attempt
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of draining the socket into the read buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Socket drained, still open
    Open,
    /// Buffer is full enough; drain it and read again
    Saturated,
    /// Peer closed the connection
    Closed,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    read_buffer: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    wanted: usize,
    last_sequence: Option<u64>,
}

impl Connection {
    /// Wrap a connected, non-blocking stream.
    pub fn new(stream: TcpStream, options: &BusOptions) -> io::Result<Self> {
        // Disable Nagle's algorithm, frames are small and latency matters
        stream.set_nodelay(true)?;
        if let Some(size) = options.socket_buffer_size {
            tune_socket(&stream, size);
        }
        let peer = stream.peer_addr()?;

        Ok(Self {
            stream,
            peer,
            read_buffer: vec![0u8; READ_BUFFER_SIZE],
            read_pos: 0,
            read_len: 0,
            wanted: 0,
            last_sequence: None,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read until the socket would block, the peer closes, or the buffer
    /// saturates.
    pub fn fill_read_buffer(&mut self) -> io::Result<ReadStatus> {
        loop {
            // Compact consumed bytes
            if self.read_pos > 0 {
                self.read_buffer.copy_within(self.read_pos..self.read_len, 0);
                self.read_len -= self.read_pos;
                self.read_pos = 0;
            }

            if self.read_len >= READ_SATURATION.max(self.wanted) {
                return Ok(ReadStatus::Saturated);
            }
            if self.read_len == self.read_buffer.len() {
                let grown = self.read_buffer.len() * 2;
                self.read_buffer.resize(grown, 0);
            }

            match self.stream.read(&mut self.read_buffer[self.read_len..]) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => self.read_len += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Buffered, unconsumed bytes
    #[inline(always)]
    pub fn readable(&self) -> &[u8] {
        &self.read_buffer[self.read_pos..self.read_len]
    }

    /// Consume n bytes from the read buffer
    #[inline(always)]
    pub fn consume(&mut self, n: usize) {
        self.read_pos += n.min(self.read_len - self.read_pos);
    }

    /// Size of the frame currently being assembled, so a frame larger than
    /// the saturation point can still be buffered whole. Zero clears it.
    pub fn expect_frame(&mut self, total_size: usize) {
        self.wanted = total_size;
    }

    /// Write queued frames until the socket would block.
    ///
    /// Returns how many frames were completed.
    pub fn write_queue(&mut self, queue: &mut OutQueue) -> io::Result<u64> {
        queue.write_to(&mut self.stream)
    }

    /// Record an inbound sequence number, returning how many frames were
    /// skipped since the previous one.
    pub fn observe_sequence(&mut self, sequence: u64) -> Option<u64> {
        let gap = match self.last_sequence {
            Some(last) if sequence > last + 1 => Some(sequence - last - 1),
            _ => None,
        };
        self.last_sequence = Some(sequence);
        gap
    }
}

/// Outbound frames for one peer, bounded by a high-water mark in messages.
///
/// Frames are shared between peers and only ever dropped whole: a frame is
/// refused before any byte of it is queued, and the front frame is the only
/// one that can be partly written.
#[derive(Debug)]
pub struct OutQueue {
    frames: VecDeque<Arc<[u8]>>,
    offset: usize,
    high_water_mark: usize,
    dropped: u64,
}

impl OutQueue {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            offset: 0,
            high_water_mark: high_water_mark.max(1),
            dropped: 0,
        }
    }

    /// Queue a burst of frames, all or none.
    ///
    /// Returns `false` (and counts the drops) when the burst would take the
    /// queue past its high-water mark. A single burst is always accepted by
    /// an empty queue.
    pub fn push_all(&mut self, frames: &[Arc<[u8]>]) -> bool {
        let fits = self.frames.is_empty() || self.frames.len() + frames.len() <= self.high_water_mark;
        if !fits {
            self.dropped += frames.len() as u64;
            return false;
        }
        self.frames.extend(frames.iter().cloned());
        true
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Restart the front frame from its first byte, for a fresh link.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// Write frames into `out` until it would block.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> io::Result<u64> {
        let mut completed = 0;

        while let Some(front) = self.frames.front() {
            let len = front.len();
            match out.write(&front[self.offset..]) {
                Ok(0) if self.offset < len => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ))
                }
                Ok(n) => self.offset += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.offset == len {
                self.frames.pop_front();
                self.offset = 0;
                completed += 1;
            }
        }

        Ok(completed)
    }
}

/// Non-blocking connection attempt, completed once the socket is writable.
pub struct PendingDial {
    stream: TcpStream,
    addr: SocketAddr,
    started: Instant,
}

impl PendingDial {
    /// Start connecting to one of `endpoint`'s addresses. Successive
    /// `attempt` numbers cycle through them.
    pub fn start(endpoint: &Endpoint, attempt: usize) -> Result<Self, BusError> {
        let addrs = endpoint.resolve()?;
        let addr = addrs[attempt % addrs.len()];
        let stream = TcpStream::connect(addr)?;

        Ok(Self {
            stream,
            addr,
            started: Instant::now(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// When the attempt is abandoned
    pub fn deadline(&self) -> Instant {
        self.started + CONNECT_TIMEOUT
    }

    /// `Ok(true)` once connected, `Ok(false)` while still in progress.
    pub fn is_connected(&mut self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(ref e) if in_progress(e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn into_connection(self, options: &BusOptions) -> io::Result<Connection> {
        Connection::new(self.stream, options)
    }
}

#[cfg(unix)]
fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn in_progress(_e: &io::Error) -> bool {
    false
}

/// Set socket buffer sizes.
///
/// Errors are ignored, not every platform honours these options.
#[cfg(unix)]
fn tune_socket(stream: &TcpStream, size: usize) {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let optval = size.min(libc::c_int::MAX as usize) as libc::c_int;
    // SAFETY: fd is a live socket owned by `stream`, optval outlives the calls
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn tune_socket(_stream: &TcpStream, _size: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, FrameDecoder, DEFAULT_MAX_PAYLOAD};
    use std::net::TcpListener;

    fn pair() -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let conn = Connection::new(TcpStream::from_std(server), &BusOptions::default()).unwrap();
        (conn, client)
    }

    fn read_until(conn: &mut Connection, len: usize) -> ReadStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = conn.fill_read_buffer().unwrap();
            if conn.readable().len() >= len || status == ReadStatus::Closed {
                return status;
            }
            assert!(Instant::now() < deadline, "timed out waiting for data");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn frame(sequence: u64, payload: &[u8]) -> Arc<[u8]> {
        let mut out = Vec::new();
        encode_frame(sequence, payload, &mut out);
        Arc::from(out)
    }

    /// Takes at most `budget` bytes, then reports WouldBlock.
    struct Stalled {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for Stalled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_and_consume() {
        let (mut conn, mut client) = pair();
        client.write_all(b"hello world").unwrap();

        read_until(&mut conn, 11);
        assert_eq!(conn.readable(), b"hello world");

        conn.consume(6);
        assert_eq!(conn.readable(), b"world");
        conn.consume(100);
        assert!(conn.readable().is_empty());
    }

    #[test]
    fn test_detects_close() {
        let (mut conn, client) = pair();
        drop(client);

        assert_eq!(read_until(&mut conn, usize::MAX), ReadStatus::Closed);
    }

    #[test]
    fn test_read_buffer_grows_past_initial_size() {
        let (mut conn, mut client) = pair();
        let big = vec![7u8; READ_BUFFER_SIZE * 3];
        let writer = std::thread::spawn(move || client.write_all(&big).unwrap());

        read_until(&mut conn, READ_BUFFER_SIZE * 3);
        writer.join().unwrap();
        assert_eq!(conn.readable().len(), READ_BUFFER_SIZE * 3);
    }

    #[test]
    fn test_write_queue_delivers() {
        let (mut conn, mut client) = pair();
        let mut queue = OutQueue::new(16);
        assert!(queue.push_all(&[Arc::from(&b"frame-bytes"[..])]));

        assert_eq!(conn.write_queue(&mut queue).unwrap(), 1);
        assert!(queue.is_empty());

        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame-bytes");
    }

    #[test]
    fn test_stalled_peer_loses_whole_frames_only() {
        let mut queue = OutQueue::new(4);
        let mut out = Stalled {
            written: Vec::new(),
            budget: 100,
        };

        let mut accepted = 0;
        for seq in 0..20u64 {
            if queue.push_all(&[frame(seq, &[seq as u8; 64])]) {
                accepted += 1;
            }
            queue.write_to(&mut out).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.dropped(), 20 - accepted);
        assert!(queue.dropped() > 0);

        // Peer catches up
        out.budget = usize::MAX;
        queue.write_to(&mut out).unwrap();
        assert!(queue.is_empty());

        let mut decoder = FrameDecoder::new(&out.written, DEFAULT_MAX_PAYLOAD);
        let mut sequences = Vec::new();
        while let Some((header, payload)) = decoder.next().unwrap() {
            assert!(payload.iter().all(|&b| b == header.sequence as u8));
            sequences.push(header.sequence);
        }
        assert_eq!(decoder.consumed(), out.written.len());
        assert_eq!(sequences.len() as u64, accepted);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_burst_is_all_or_nothing() {
        let mut queue = OutQueue::new(3);
        let pair = [frame(0, b"payload"), frame(1, b"invalid message")];

        assert!(queue.push_all(&pair));
        assert!(!queue.push_all(&pair));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 2);

        // An empty queue takes a burst larger than the mark
        let mut tiny = OutQueue::new(1);
        assert!(tiny.push_all(&pair));
        assert_eq!(tiny.len(), 2);
    }

    #[test]
    fn test_rewind_resends_front_frame() {
        let mut queue = OutQueue::new(4);
        queue.push_all(&[frame(0, b"abcdef")]);

        let mut first = Stalled {
            written: Vec::new(),
            budget: 10,
        };
        assert_eq!(queue.write_to(&mut first).unwrap(), 0);

        queue.rewind();
        let mut second = Stalled {
            written: Vec::new(),
            budget: usize::MAX,
        };
        assert_eq!(queue.write_to(&mut second).unwrap(), 1);
        assert_eq!(&*second.written, &*frame(0, b"abcdef"));
    }

    #[test]
    fn test_pending_dial_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        let mut dial = PendingDial::start(&endpoint, 0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !dial.is_connected().unwrap() {
            assert!(Instant::now() < deadline, "connect never completed");
            std::thread::sleep(Duration::from_millis(1));
        }
        let conn = dial.into_connection(&BusOptions::default()).unwrap();
        assert_eq!(conn.peer(), listener.local_addr().unwrap());
    }

    #[test]
    fn test_pending_dial_reports_refusal() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = Endpoint::new("127.0.0.1", port);

        let deadline = Instant::now() + Duration::from_secs(5);
        let refused = match PendingDial::start(&endpoint, 0) {
            Err(_) => true,
            Ok(mut dial) => loop {
                match dial.is_connected() {
                    Err(_) => break true,
                    Ok(true) => break false,
                    Ok(false) => {
                        assert!(Instant::now() < deadline, "no verdict on refused connect");
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            },
        };
        assert!(refused);
    }

    #[test]
    fn test_sequence_gaps() {
        let (mut conn, _client) = pair();
        assert_eq!(conn.observe_sequence(0), None);
        assert_eq!(conn.observe_sequence(1), None);
        assert_eq!(conn.observe_sequence(5), Some(3));
        assert_eq!(conn.observe_sequence(6), None);
    }
}
