//! Bus frame format
//!
//! Layout:
//! ┌─────────────────────────────────────────────────────┐
//! │ FrameHeader (24 bytes, fixed, little-endian)        │
//! ├─────────────────────────────────────────────────────┤
//! │ Payload (opaque bytes, variable length)             │
//! └─────────────────────────────────────────────────────┘
//!
//! The payload is never inspected here; JSON lives one layer up.

/// Magic number ("ZPRX")
pub const FRAME_MAGIC: u32 = 0x5A50_5258;
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_SIZE: usize = 24;
/// Default payload limit (64 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("frame checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    Checksum { expected: u32, actual: u32 },
}

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Reserved, always zero for now
    pub flags: u8,
    /// Per-publisher sequence number
    pub sequence: u64,
    /// Payload length in bytes
    pub payload_len: u32,
    /// CRC32C of the payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Header describing `payload`
    pub fn for_payload(sequence: u64, payload: &[u8]) -> Self {
        Self {
            flags: 0,
            sequence,
            payload_len: payload.len() as u32,
            checksum: crc32c::crc32c(payload),
        }
    }

    /// Append the 24 header bytes to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        out.push(FRAME_VERSION);
        out.push(self.flags);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` while fewer than `FRAME_HEADER_SIZE` bytes are
    /// available.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<Self>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        if buf[4] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(buf[4]));
        }

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&buf[8..16]);
        let payload_len = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let checksum = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);

        if payload_len as usize > max_payload {
            return Err(FrameError::TooLarge {
                len: payload_len as usize,
                max: max_payload,
            });
        }

        Ok(Some(Self {
            flags: buf[5],
            sequence: u64::from_le_bytes(sequence),
            payload_len,
            checksum,
        }))
    }

    /// Total frame size (header + payload)
    #[inline(always)]
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len as usize
    }
}

/// Append one complete frame for `payload` to `out`.
pub fn encode_frame(sequence: u64, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(FRAME_HEADER_SIZE + payload.len());
    FrameHeader::for_payload(sequence, payload).write_to(out);
    out.extend_from_slice(payload);
}

/// Zero-copy frame reader over a byte buffer
pub struct FrameDecoder<'a> {
    buffer: &'a [u8],
    read_pos: usize,
    max_payload: usize,
}

impl<'a> FrameDecoder<'a> {
    pub fn new(buffer: &'a [u8], max_payload: usize) -> Self {
        Self {
            buffer,
            read_pos: 0,
            max_payload,
        }
    }

    /// Next complete frame, `Ok(None)` if the buffer ends mid-frame.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(FrameHeader, &'a [u8])>, FrameError> {
        let rest = &self.buffer[self.read_pos..];
        let Some(header) = FrameHeader::parse(rest, self.max_payload)? else {
            return Ok(None);
        };

        if rest.len() < header.total_size() {
            return Ok(None);
        }

        let payload = &rest[FRAME_HEADER_SIZE..header.total_size()];
        let actual = crc32c::crc32c(payload);
        if actual != header.checksum {
            return Err(FrameError::Checksum {
                expected: header.checksum,
                actual,
            });
        }

        self.read_pos += header.total_size();
        Ok(Some((header, payload)))
    }

    /// Bytes consumed by complete frames so far
    #[inline(always)]
    pub fn consumed(&self) -> usize {
        self.read_pos
    }
}
