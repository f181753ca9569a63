//! Chunk encoding.
//!
//! Turns a buffered chunk of records into the exact bytes of one uploaded
//! object: newline-delimited JSON or a single JSON array, optionally wrapped
//! in a gzip stream.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::io::Write;
use thiserror::Error;

/// Errors that can occur while encoding a chunk
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Failed to serialize record {index}: {source}")]
    Serialize {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record {index} is not a JSON object (found {kind})")]
    NotAnObject { index: usize, kind: &'static str },

    #[error("Failed to write chunk: {0}")]
    Io(#[from] std::io::Error),
}

/// Line format of an uploaded chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFormat {
    /// One JSON object per line
    #[default]
    #[serde(alias = "jl", alias = "jsonl", alias = "jsonlines")]
    JsonLines,
    /// All records wrapped in a single JSON array
    Json,
}

impl ChunkFormat {
    /// Pick a format from a key extension (without any `.gz` suffix)
    pub fn from_extension(extension: &str) -> Self {
        if extension.eq_ignore_ascii_case("json") {
            ChunkFormat::Json
        } else {
            ChunkFormat::JsonLines
        }
    }

    /// MIME type of an uncompressed chunk
    pub fn content_type(&self) -> &'static str {
        match self {
            ChunkFormat::JsonLines => "application/x-ndjson",
            ChunkFormat::Json => "application/json",
        }
    }
}

/// Pass-through formatting options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EncoderOptions {
    /// Export only these fields, in this order
    #[serde(default)]
    pub fields_to_export: Option<Vec<String>>,
    /// Pretty-print array output with this many spaces per level
    #[serde(default)]
    pub indent: Option<usize>,
}

/// Encode `records` in submission order.
///
/// The returned buffer is complete and positioned at its start, ready to be
/// handed to a storage backend.
pub fn encode<T: Serialize>(
    records: &[T],
    format: ChunkFormat,
    compress: bool,
    options: &EncoderOptions,
) -> Result<Bytes, EncodeError> {
    if compress {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        write_records(&mut gz, records, format, options)?;
        Ok(Bytes::from(gz.finish()?))
    } else {
        let mut buf = Vec::new();
        write_records(&mut buf, records, format, options)?;
        Ok(Bytes::from(buf))
    }
}

fn write_records<W: Write, T: Serialize>(
    writer: &mut W,
    records: &[T],
    format: ChunkFormat,
    options: &EncoderOptions,
) -> Result<(), EncodeError> {
    match format {
        ChunkFormat::JsonLines => {
            for (index, record) in records.iter().enumerate() {
                let object = project(index, record, options)?;
                serde_json::to_writer(&mut *writer, &object)
                    .map_err(|source| EncodeError::Serialize { index, source })?;
                writer.write_all(b"\n")?;
            }
        }
        ChunkFormat::Json => {
            let indent = options.indent.map(|n| vec![b' '; n]);

            writer.write_all(b"[")?;
            for (index, record) in records.iter().enumerate() {
                if index > 0 {
                    writer.write_all(b",")?;
                }
                if indent.is_some() {
                    writer.write_all(b"\n")?;
                }

                let object = project(index, record, options)?;
                let written = match &indent {
                    Some(indent) => {
                        let formatter = PrettyFormatter::with_indent(indent);
                        let mut ser = serde_json::Serializer::with_formatter(&mut *writer, formatter);
                        object.serialize(&mut ser)
                    }
                    None => serde_json::to_writer(&mut *writer, &object),
                };
                written.map_err(|source| EncodeError::Serialize { index, source })?;
            }
            if indent.is_some() && !records.is_empty() {
                writer.write_all(b"\n")?;
            }
            writer.write_all(b"]")?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// Serialize one record to a JSON object and apply `fields_to_export`
fn project<T: Serialize>(
    index: usize,
    record: &T,
    options: &EncoderOptions,
) -> Result<Map<String, Value>, EncodeError> {
    let value =
        serde_json::to_value(record).map_err(|source| EncodeError::Serialize { index, source })?;

    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(EncodeError::NotAnObject {
                index,
                kind: kind_of(&other),
            })
        }
    };

    match &options.fields_to_export {
        Some(fields) => Ok(fields
            .iter()
            .filter_map(|field| object.remove(field).map(|v| (field.clone(), v)))
            .collect()),
        None => Ok(object),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
