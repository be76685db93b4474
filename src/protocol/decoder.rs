//! JSON payload → decoded fields
//!
//! Decoding is all-or-nothing: a payload either yields every field or an
//! error, so a bad message never produces partial output.
//!
//! Prefixed payloads carry no schema. A field whose JSON value is an array is
//! binary (first element, Base64); anything else is a plain primitive.

use std::io::{self, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value as Json};

use super::encoder::WireFormat;
use super::value::{Integer, Record, Value};

/// Line written after every rendered message
pub const SEPARATOR: &str = "---------------";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),

    #[error("binary field `{field}` must be an array holding one string")]
    BinaryShape { field: String },

    #[error("binary field `{field}` is not valid base64: {source}")]
    Base64 {
        field: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("tagged field `{field}` is malformed: {reason}")]
    Tag { field: String, reason: &'static str },

    #[error("field `{field}` holds a JSON {kind}, which has no typed counterpart")]
    Unsupported { field: String, kind: &'static str },
}

/// Decoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Raw bytes recovered from the binary convention
    Binary(Vec<u8>),
    /// Any other JSON value, kept as parsed
    Json(Json),
    /// Tagged float sent as `null`: a non-finite real
    NonFinite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub name: String,
    pub value: FieldValue,
}

/// One decoded payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMessage {
    fields: Vec<DecodedField>,
}

impl DecodedMessage {
    pub fn fields(&self) -> &[DecodedField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Write `<name>: <value>` per field, then the separator line.
    ///
    /// Binary values are written verbatim, not escaped.
    pub fn render<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for field in &self.fields {
            write!(out, "{}: ", field.name)?;
            match &field.value {
                FieldValue::Binary(bytes) => out.write_all(bytes)?,
                FieldValue::Json(json) => write_repr(out, json)?,
                FieldValue::NonFinite => out.write_all(b"null")?,
            }
            out.write_all(b"\n")?;
        }
        writeln!(out, "{SEPARATOR}")
    }

    /// Convert into a typed record.
    ///
    /// Integer literals (no fraction or exponent) become `Integer`, other
    /// numbers `Real`. Booleans, arrays and objects have no typed
    /// counterpart and are rejected. A tagged float `null` comes back as NaN;
    /// in the prefixed format a non-finite real is indistinguishable from
    /// `Null` and decodes as such.
    pub fn into_record(self) -> Result<Record, DecodeError> {
        let mut record = Record::new();

        for DecodedField { name, value } in self.fields {
            let typed = match value {
                FieldValue::Binary(bytes) => Value::Binary(bytes),
                FieldValue::Json(json) => typed_value(&name, json)?,
                FieldValue::NonFinite => Value::Real(f64::NAN),
            };
            record.insert(name, typed);
        }

        Ok(record)
    }
}

/// Decode a raw payload in the given wire format.
pub fn decode_message(payload: &[u8], format: WireFormat) -> Result<DecodedMessage, DecodeError> {
    let object = match serde_json::from_slice::<Json>(payload)? {
        Json::Object(object) => object,
        other => return Err(DecodeError::NotAnObject(json_kind(&other))),
    };

    let fields = match format {
        WireFormat::Prefixed => prefixed_fields(object)?,
        WireFormat::Tagged => tagged_fields(object)?,
    };

    Ok(DecodedMessage { fields })
}

fn prefixed_fields(object: Map<String, Json>) -> Result<Vec<DecodedField>, DecodeError> {
    object
        .into_iter()
        .map(|(name, json)| {
            let value = match json {
                Json::Array(items) => FieldValue::Binary(binary_from_array(&name, items)?),
                other => FieldValue::Json(other),
            };
            Ok::<_, DecodeError>(DecodedField { name, value })
        })
        .collect()
}

fn binary_from_array(name: &str, items: Vec<Json>) -> Result<Vec<u8>, DecodeError> {
    match items.into_iter().next() {
        Some(Json::String(text)) => decode_base64(name, &text),
        _ => Err(DecodeError::BinaryShape {
            field: name.to_string(),
        }),
    }
}

fn decode_base64(name: &str, text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(text).map_err(|source| DecodeError::Base64 {
        field: name.to_string(),
        source,
    })
}

fn tagged_fields(object: Map<String, Json>) -> Result<Vec<DecodedField>, DecodeError> {
    let mut fields = Vec::with_capacity(object.len());

    for (name, json) in object {
        let Json::Object(mut wrapper) = json else {
            return Err(DecodeError::Tag {
                field: name,
                reason: "expected an object",
            });
        };

        let tag = match wrapper.remove("type") {
            Some(Json::String(tag)) => tag,
            _ => {
                return Err(DecodeError::Tag {
                    field: name,
                    reason: "missing `type`",
                })
            }
        };
        let Some(inner) = wrapper.remove("value") else {
            return Err(DecodeError::Tag {
                field: name,
                reason: "missing `value`",
            });
        };

        let value = match (tag.as_str(), inner) {
            ("binary", Json::String(text)) => FieldValue::Binary(decode_base64(&name, &text)?),
            ("null", Json::Null) => FieldValue::Json(Json::Null),
            ("int", Json::Number(n)) if is_integer_literal(&n.to_string()) => {
                FieldValue::Json(Json::Number(n))
            }
            ("float", Json::Number(n)) => FieldValue::Json(Json::Number(n)),
            ("float", Json::Null) => FieldValue::NonFinite,
            ("string", Json::String(s)) => FieldValue::Json(Json::String(s)),
            ("binary" | "null" | "int" | "float" | "string", _) => {
                return Err(DecodeError::Tag {
                    field: name,
                    reason: "value does not match its type",
                })
            }
            _ => {
                return Err(DecodeError::Tag {
                    field: name,
                    reason: "unknown type",
                })
            }
        };

        fields.push(DecodedField { name, value });
    }

    Ok(fields)
}

fn typed_value(name: &str, json: Json) -> Result<Value, DecodeError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::String(s) => Ok(Value::String(s)),
        Json::Number(n) => {
            let literal = n.to_string();
            if is_integer_literal(&literal) {
                Integer::parse(&literal)
                    .map(Value::Integer)
                    .map_err(|_| DecodeError::Unsupported {
                        field: name.to_string(),
                        kind: "number",
                    })
            } else {
                n.as_f64().map(Value::Real).ok_or(DecodeError::Unsupported {
                    field: name.to_string(),
                    kind: "number",
                })
            }
        }
        other => Err(DecodeError::Unsupported {
            field: name.to_string(),
            kind: json_kind(&other),
        }),
    }
}

fn is_integer_literal(literal: &str) -> bool {
    !literal.contains(['.', 'e', 'E'])
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Debug-style text for a JSON value: strings quoted and escaped, numbers as
/// their exact literal, containers as compact JSON.
fn write_repr<W: Write>(out: &mut W, json: &Json) -> io::Result<()> {
    match json {
        Json::String(s) => write!(out, "{s:?}"),
        other => write!(out, "{other}"),
    }
}
