// Copyright The Subflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Payload parsers turning one broker message into zero or more records.

use crate::message::{Message, MessageId};
use serde_json::Value;
use subflow_config::{DataFormat, SourceConfig};

/// A record parsed out of a message payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Message the record came from.
    pub message_id: MessageId,
    /// Position of the record within its message.
    pub index: usize,
    /// Parsed value. Text records are JSON strings.
    pub value: Value,
}

/// Errors raised while parsing a single message.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The payload is not valid UTF-8.
    #[error("payload is not valid UTF-8 at byte {valid_up_to}")]
    InvalidUtf8 {
        /// Length of the valid prefix.
        valid_up_to: usize,
    },
    /// A record is longer than the configured maximum.
    #[error("record {index} is {length} bytes, exceeding the limit of {max_record_length}")]
    RecordTooLarge {
        /// Position of the offending record.
        index: usize,
        /// Record length in bytes.
        length: usize,
        /// Configured maximum.
        max_record_length: usize,
    },
    /// The payload is not a stream of JSON values.
    #[error("malformed JSON at line {line}, column {column}: {details}")]
    MalformedJson {
        /// Line of the error.
        line: usize,
        /// Column of the error.
        column: usize,
        /// Parser message.
        details: String,
    },
    /// Parser-specific failure.
    #[error("{0}")]
    Custom(String),
}

/// Turns a message payload into records.
///
/// Implementations must be deterministic and side-effect free: a parse failure
/// nacks only the offending message.
pub trait RecordParser: Send + Sync + 'static {
    /// Record type produced by this parser.
    type Record: Send + 'static;

    /// Parses one message.
    fn parse(&self, message: &Message) -> Result<Vec<Self::Record>, ParseError>;
}

/// One record per line of UTF-8 text. Blank lines are skipped.
#[derive(Debug, Clone, Copy)]
pub struct TextParser {
    max_record_length: usize,
}

impl TextParser {
    /// Creates a text parser.
    #[must_use]
    pub const fn new(max_record_length: usize) -> Self {
        Self { max_record_length }
    }
}

impl RecordParser for TextParser {
    type Record = Record;

    fn parse(&self, message: &Message) -> Result<Vec<Record>, ParseError> {
        let text = std::str::from_utf8(message.payload()).map_err(|e| ParseError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(index, line)| {
                check_length(index, line.len(), self.max_record_length)?;
                Ok(Record {
                    message_id: message.id().clone(),
                    index,
                    value: Value::String(line.to_owned()),
                })
            })
            .collect()
    }
}

/// One record per JSON value in a whitespace-separated stream.
#[derive(Debug, Clone, Copy)]
pub struct JsonParser {
    max_record_length: usize,
}

impl JsonParser {
    /// Creates a JSON parser.
    #[must_use]
    pub const fn new(max_record_length: usize) -> Self {
        Self { max_record_length }
    }
}

impl RecordParser for JsonParser {
    type Record = Record;

    fn parse(&self, message: &Message) -> Result<Vec<Record>, ParseError> {
        let mut stream = serde_json::Deserializer::from_slice(message.payload()).into_iter::<Value>();
        let mut records = Vec::new();
        let mut start = 0;
        while let Some(next) = stream.next() {
            let value = next.map_err(|e| ParseError::MalformedJson {
                line: e.line(),
                column: e.column(),
                details: e.to_string(),
            })?;
            let end = stream.byte_offset();
            let index = records.len();
            let raw = message.payload().get(start..end).unwrap_or_default();
            check_length(index, raw.trim_ascii().len(), self.max_record_length)?;
            start = end;
            records.push(Record {
                message_id: message.id().clone(),
                index,
                value,
            });
        }
        Ok(records)
    }
}

fn check_length(index: usize, length: usize, max_record_length: usize) -> Result<(), ParseError> {
    if length > max_record_length {
        return Err(ParseError::RecordTooLarge {
            index,
            length,
            max_record_length,
        });
    }
    Ok(())
}

/// Parser selected by [`DataFormat`].
#[derive(Debug, Clone, Copy)]
pub enum FormatParser {
    /// See [`TextParser`].
    Text(TextParser),
    /// See [`JsonParser`].
    Json(JsonParser),
}

impl FormatParser {
    /// Builds the parser configured for a source.
    #[must_use]
    pub fn from_config(config: &SourceConfig) -> Self {
        match config.data_format {
            DataFormat::Text => Self::Text(TextParser::new(config.max_record_length)),
            DataFormat::Json => Self::Json(JsonParser::new(config.max_record_length)),
        }
    }
}

impl RecordParser for FormatParser {
    type Record = Record;

    fn parse(&self, message: &Message) -> Result<Vec<Record>, ParseError> {
        match self {
            Self::Text(parser) => parser.parse(message),
            Self::Json(parser) => parser.parse(message),
        }
    }
}
