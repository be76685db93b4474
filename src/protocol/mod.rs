//! Protocol layer
//!
//! - value: typed record model (arbitrary-precision integers, raw bytes)
//! - encoder/decoder: record ⇄ JSON payload, prefixed or tagged
//! - frame: length-delimited, checksummed frames carrying payloads on the bus

mod decoder;
mod encoder;
mod frame;
mod value;

pub use decoder::{decode_message, DecodeError, DecodedField, DecodedMessage, FieldValue, SEPARATOR};
pub use encoder::{encode_record, EncodeError, RecordEncoder, WireFormat};
pub use frame::{
    encode_frame, FrameDecoder, FrameError, FrameHeader, DEFAULT_MAX_PAYLOAD,
    FRAME_HEADER_SIZE, FRAME_MAGIC, FRAME_VERSION,
};
pub use value::{is_binary_name, Integer, Record, Value, ValueError, BINARY_PREFIX};
