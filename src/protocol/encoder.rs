//! Record → JSON payload
//!
//! Two wire formats:
//! - Prefixed: the avis-zmqprx convention. Binary becomes `["<base64>"]`,
//!   everything else is a bare JSON primitive.
//! - Tagged: every field is `{"type": .., "value": ..}`.
//!
//! Encoding writes into a reusable buffer, like the frame encoder.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Number, Value as Json};

use super::value::{is_binary_name, Record, Value};

/// JSON layout used for record payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum WireFormat {
    /// `_`-prefixed names, binary wrapped in a one-element array
    #[default]
    Prefixed,
    /// Explicit `{"type", "value"}` wrapper per field
    Tagged,
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("field `{field}` uses the binary prefix but holds a {kind} value")]
    NotBinary { field: String, kind: &'static str },

    #[error("binary field `{field}` does not start with `_`")]
    MissingPrefix { field: String },

    #[error("integer `{0}` cannot be written as a JSON number")]
    Integer(String),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reusable record encoder
pub struct RecordEncoder {
    format: WireFormat,
    strict: bool,
    buffer: Vec<u8>,
}

impl RecordEncoder {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            strict: false,
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Reject records that break the `_` ⇔ binary naming rule.
    ///
    /// Only meaningful for the prefixed format; the tagged format carries
    /// the type explicitly.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Encode a record. The returned slice is valid until the next call.
    pub fn encode(&mut self, record: &Record) -> Result<&[u8], EncodeError> {
        let object = match self.format {
            WireFormat::Prefixed => self.prefixed_object(record)?,
            WireFormat::Tagged => tagged_object(record)?,
        };

        self.buffer.clear();
        serde_json::to_writer(&mut self.buffer, &Json::Object(object))?;

        tracing::trace!(
            fields = record.len(),
            bytes = self.buffer.len(),
            format = ?self.format,
            "encoded record"
        );

        Ok(&self.buffer)
    }

    fn prefixed_object(&self, record: &Record) -> Result<Map<String, Json>, EncodeError> {
        let mut object = Map::new();

        for (name, value) in record {
            if self.strict {
                check_prefix(name, value)?;
            }

            let json = match value {
                Value::Binary(bytes) => Json::Array(vec![Json::String(STANDARD.encode(bytes))]),
                other => primitive(other)?,
            };
            object.insert(name.clone(), json);
        }

        Ok(object)
    }
}

/// One-shot encode into a fresh buffer.
pub fn encode_record(record: &Record, format: WireFormat) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = RecordEncoder::new(format);
    Ok(encoder.encode(record)?.to_vec())
}

fn check_prefix(name: &str, value: &Value) -> Result<(), EncodeError> {
    match (is_binary_name(name), value.is_binary()) {
        (true, false) => Err(EncodeError::NotBinary {
            field: name.to_string(),
            kind: value.kind(),
        }),
        (false, true) => Err(EncodeError::MissingPrefix {
            field: name.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Non-binary value as a bare JSON primitive.
///
/// Non-finite reals have no JSON spelling and go out as `null`.
fn primitive(value: &Value) -> Result<Json, EncodeError> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Integer(i) => Json::Number(integer_number(i.as_str())?),
        Value::Real(r) => match Number::from_f64(*r) {
            Some(n) => Json::Number(n),
            None => {
                tracing::debug!(value = %r, "non-finite real encoded as null");
                Json::Null
            }
        },
        Value::String(s) => Json::String(s.clone()),
        Value::Binary(bytes) => Json::String(STANDARD.encode(bytes)),
    })
}

fn integer_number(digits: &str) -> Result<Number, EncodeError> {
    // arbitrary_precision keeps the literal intact
    serde_json::from_str::<Number>(digits).map_err(|_| EncodeError::Integer(digits.to_string()))
}

fn tagged_object(record: &Record) -> Result<Map<String, Json>, EncodeError> {
    let mut object = Map::new();

    for (name, value) in record {
        let mut field = Map::new();
        field.insert("type".to_string(), Json::String(value.kind().to_string()));
        field.insert("value".to_string(), primitive(value)?);
        object.insert(name.clone(), Json::Object(field));
    }

    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::value::Integer;

    fn as_json(bytes: &[u8]) -> Json {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_prefixed_wraps_binary_in_array() {
        let record = Record::new().with("_opaque", b"hola".as_slice());
        let bytes = encode_record(&record, WireFormat::Prefixed).unwrap();

        assert_eq!(bytes, br#"{"_opaque":["aG9sYQ=="]}"#);
    }

    #[test]
    fn test_prefixed_primitives() {
        let record = Record::new()
            .with("minus1", -1i64)
            .with("Naan", Value::Null)
            .with("_real", 452354.5)
            .with("_string", "yo");
        let json = as_json(&encode_record(&record, WireFormat::Prefixed).unwrap());

        assert_eq!(json["minus1"].to_string(), "-1");
        assert!(json["Naan"].is_null());
        assert_eq!(json["_real"].to_string(), "452354.5");
        assert_eq!(json["_string"], "yo");
    }

    #[test]
    fn test_big_integer_is_exact_on_the_wire() {
        let big = Integer::parse("5425423523544523524523525245").unwrap();
        let record = Record::new().with("Opaque", big);
        let bytes = encode_record(&record, WireFormat::Prefixed).unwrap();

        assert_eq!(bytes, br#"{"Opaque":5425423523544523524523525245}"#);
    }

    #[test]
    fn test_non_finite_real_becomes_null() {
        let record = Record::new().with("nan", f64::NAN).with("inf", f64::INFINITY);
        let json = as_json(&encode_record(&record, WireFormat::Prefixed).unwrap());

        assert!(json["nan"].is_null());
        assert!(json["inf"].is_null());
    }

    #[test]
    fn test_strict_prefix_checks() {
        let mut encoder = RecordEncoder::new(WireFormat::Prefixed).strict(true);

        let bad = Record::new().with("_string", "yo");
        assert!(matches!(
            encoder.encode(&bad),
            Err(EncodeError::NotBinary { kind: "string", .. })
        ));

        let bad = Record::new().with("blob", vec![1u8, 2, 3]);
        assert!(matches!(
            encoder.encode(&bad),
            Err(EncodeError::MissingPrefix { .. })
        ));

        let good = Record::new().with("_blob", vec![1u8]).with("n", 1i64);
        assert!(encoder.encode(&good).is_ok());
    }

    #[test]
    fn test_lenient_mode_allows_prefixed_primitives() {
        let mut encoder = RecordEncoder::new(WireFormat::Prefixed);
        let record = Record::new().with("_real", 1.5).with("blob", vec![0xffu8]);

        let json = as_json(encoder.encode(&record).unwrap());
        assert_eq!(json["_real"].to_string(), "1.5");
        assert_eq!(json["blob"][0], "/w==");
    }

    #[test]
    fn test_tagged_layout() {
        let record = Record::new()
            .with("bytes", vec![0u8, 159, 146, 150])
            .with("n", Value::Null)
            .with("count", 7i64);
        let json = as_json(&encode_record(&record, WireFormat::Tagged).unwrap());

        assert_eq!(json["bytes"]["type"], "binary");
        assert_eq!(json["bytes"]["value"], "AJ+Slg==");
        assert_eq!(json["n"]["type"], "null");
        assert!(json["n"]["value"].is_null());
        assert_eq!(json["count"]["type"], "int");
        assert_eq!(json["count"]["value"].to_string(), "7");
    }

    #[test]
    fn test_encoder_buffer_reuse() {
        let mut encoder = RecordEncoder::new(WireFormat::Prefixed);

        encoder.encode(&Record::new().with("first", "a long value")).unwrap();
        let second = encoder.encode(&Record::new().with("b", 2i64)).unwrap();

        assert_eq!(second, br#"{"b":2}"#);
    }
}
