//! On-disk layout of trays and cords.
//!
//! Documents are written one entry per line:
//!
//! ```text
//! {
//! "name":"Ada",
//! "plan":{"tier":"free"}
//! }
//! ```
//!
//! and arrays the same way with `[` and `]`. Every such file is valid JSON.
//! Reading accepts any JSON document of the right shape (compact or pretty
//! printed). Line-formatted objects may also repeat a key or miss a comma,
//! which happens when tools append a property at the end; the later line
//! wins.

use serde_json::{Map, Value};

use crate::path::StoragePath;
use crate::storage::{StorageError, StorageResult};

const LF: char = '\n';

fn serialize(value: &impl serde::Serialize) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializeError(e.to_string()))
}

/// Render an object in line format.
///
/// # Errors
///
/// Returns `StorageError::SerializeError` if a value cannot be rendered.
pub fn write_object(object: &Map<String, Value>) -> StorageResult<Vec<u8>> {
    let mut out = String::from("{");
    out.push(LF);
    let last = object.len().saturating_sub(1);
    for (i, (key, value)) in object.iter().enumerate() {
        out.push_str(&serialize(key)?);
        out.push(':');
        out.push_str(&serialize(value)?);
        if i < last {
            out.push(',');
        }
        out.push(LF);
    }
    out.push('}');
    Ok(out.into_bytes())
}

/// Render an array in line format.
///
/// # Errors
///
/// Returns `StorageError::SerializeError` if an element cannot be rendered.
pub fn write_array<T: serde::Serialize>(items: &[T]) -> StorageResult<Vec<u8>> {
    let mut out = String::from("[");
    out.push(LF);
    let last = items.len().saturating_sub(1);
    for (i, item) in items.iter().enumerate() {
        out.push_str(&serialize(item)?);
        if i < last {
            out.push(',');
        }
        out.push(LF);
    }
    out.push(']');
    Ok(out.into_bytes())
}

fn parse_error(path: &StoragePath, e: impl std::fmt::Display) -> StorageError {
    StorageError::ParseError(format!("{path}: {e}"))
}

fn body<'a>(path: &StoragePath, bytes: &'a [u8]) -> StorageResult<Option<&'a str>> {
    let text = std::str::from_utf8(bytes).map_err(|e| parse_error(path, e))?;
    let text = text.trim();
    Ok((!text.is_empty()).then_some(text))
}

/// Lines between the opening and closing bracket, if `text` is laid out
/// one entry per line.
fn entry_lines(text: &str, open: char, close: char) -> Option<impl Iterator<Item = &str>> {
    let inner = text.strip_prefix(open)?.strip_suffix(close)?;
    inner.starts_with(LF).then(|| {
        inner
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.strip_suffix(',').unwrap_or(line))
    })
}

/// Split `"key":value` at the colon that ends the key.
fn split_property(line: &str) -> Option<(String, &str)> {
    let rest = line.strip_prefix('"')?;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => {
                let key: String = serde_json::from_str(&line[..i + 2]).ok()?;
                let value = rest[i + 1..].trim_start().strip_prefix(':')?;
                return Some((key, value.trim()));
            }
            _ => {}
        }
    }
    None
}

/// Parse a stored object. Empty input is an empty object.
///
/// # Errors
///
/// Returns `StorageError::ParseError` if the bytes are not a JSON object.
pub fn read_object(path: &StoragePath, bytes: &[u8]) -> StorageResult<Map<String, Value>> {
    let Some(text) = body(path, bytes)? else {
        return Ok(Map::new());
    };
    let whole_err = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => return Ok(object),
        Ok(other) => {
            return Err(parse_error(path, format!("expected an object, found {}", kind(&other))));
        }
        Err(e) => e,
    };

    let lines = entry_lines(text, '{', '}').ok_or_else(|| parse_error(path, &whole_err))?;
    let mut object = Map::new();
    for line in lines {
        let (key, value) = split_property(line)
            .ok_or_else(|| parse_error(path, format!("malformed property line: {line}")))?;
        let value: Value = serde_json::from_str(value).map_err(|e| parse_error(path, e))?;
        object.insert(key, value);
    }
    Ok(object)
}

/// Parse a stored array. Empty input is an empty array.
///
/// # Errors
///
/// Returns `StorageError::ParseError` if the bytes are not a JSON array.
pub fn read_array(path: &StoragePath, bytes: &[u8]) -> StorageResult<Vec<Value>> {
    let Some(text) = body(path, bytes)? else {
        return Ok(Vec::new());
    };
    let whole_err = match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => return Ok(items),
        Ok(other) => {
            return Err(parse_error(path, format!("expected an array, found {}", kind(&other))));
        }
        Err(e) => e,
    };

    let lines = entry_lines(text, '[', ']').ok_or_else(|| parse_error(path, &whole_err))?;
    lines
        .map(|line| serde_json::from_str(line).map_err(|e| parse_error(path, e)))
        .collect()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
