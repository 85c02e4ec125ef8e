//! Structural validation of inbound prompt frames.
//!
//! A frame is accepted only if it is a JSON object of type `"prompt"` that
//! carries a `content` field whose serialized form stays under
//! [`MAX_HISTORY_SIZE`] characters. The size is measured on the canonical
//! encoding clients historically produced (`", "` and `": "` separators, every
//! character outside printable ASCII written as a `\uXXXX` escape), so the
//! accept/reject boundary does not move with the server's own serializer.

use crate::limits::MAX_HISTORY_SIZE;
use crate::protocol::ConversationHistory;
use serde::Serialize;
use serde_json::{Map, Value, ser::Formatter};
use std::io;

/// A prompt that passed every structural check.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPrompt {
    pub content: ConversationHistory,
    pub metadata: Map<String, Value>,
}

/// Why a frame was rejected. The `Display` text is sent back to the client.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("unsupported message type, expected \"prompt\"")]
    UnsupportedType,
    #[error("prompt is missing the \"content\" field")]
    MissingContent,
    #[error("conversation history exceeds the maximum size of {max} characters")]
    TooLarge { size: usize, max: usize },
    #[error("content must be a list of conversation turns: {0}")]
    InvalidContent(#[source] serde_json::Error),
    #[error("metadata must be a JSON object")]
    InvalidMetadata,
}

/// Parses and checks a raw frame using the default size ceiling.
pub fn validate_prompt(raw: &[u8]) -> Result<ValidatedPrompt, ValidationError> {
    validate_prompt_with_limit(raw, MAX_HISTORY_SIZE)
}

pub fn validate_prompt_with_limit(
    raw: &[u8],
    max_size: usize,
) -> Result<ValidatedPrompt, ValidationError> {
    let value: Value = serde_json::from_slice(raw).map_err(ValidationError::MalformedJson)?;
    let Value::Object(mut obj) = value else {
        return Err(ValidationError::NotAnObject);
    };
    if obj.get("type").and_then(Value::as_str) != Some("prompt") {
        return Err(ValidationError::UnsupportedType);
    }
    let content = obj
        .remove("content")
        .ok_or(ValidationError::MissingContent)?;

    let size = canonical_len(&content);
    if size > max_size {
        return Err(ValidationError::TooLarge {
            size,
            max: max_size,
        });
    }

    let content: ConversationHistory = match content {
        Value::Null => Vec::new(),
        other => serde_json::from_value(other).map_err(ValidationError::InvalidContent)?,
    };

    let metadata = match obj.remove("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ValidationError::InvalidMetadata),
    };

    Ok(ValidatedPrompt { content, metadata })
}

/// Length in characters of `value` in the canonical encoding.
pub fn canonical_len(value: &Value) -> usize {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter);
    // Writing into a Vec cannot fail and a `Value` always serializes.
    if value.serialize(&mut ser).is_err() {
        return usize::MAX;
    }
    // Everything outside printable ASCII is escaped, so bytes == characters.
    buf.len()
}

struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        for c in fragment.chars() {
            if (' '..='~').contains(&c) {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}
