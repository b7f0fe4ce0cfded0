//! Typed accessors over loosely structured JSON documents.
//!
//! License responses key their license material by hardware DNA, so they are
//! navigated as [`serde_json::Value`] rather than derived structs. The
//! helpers here turn missing or mistyped fields into [`DrmError::BadFormat`];
//! call sites that consume web service responses remap that to
//! [`DrmError::WebServiceResponse`].

use crate::error::{DrmError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

pub(crate) fn required<'a>(value: &'a Value, key: &str) -> Result<&'a Value> {
    value
        .get(key)
        .ok_or_else(|| DrmError::BadFormat(format!("missing field '{key}'")))
}

pub(crate) fn required_object<'a>(value: &'a Value, key: &str) -> Result<&'a Value> {
    let node = required(value, key)?;
    if node.is_object() {
        Ok(node)
    } else {
        Err(DrmError::BadFormat(format!(
            "field '{key}' must be an object"
        )))
    }
}

pub(crate) fn required_str<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    required(value, key)?
        .as_str()
        .ok_or_else(|| DrmError::BadFormat(format!("field '{key}' must be a string")))
}

pub(crate) fn required_u32(value: &Value, key: &str) -> Result<u32> {
    required(value, key)?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| DrmError::BadFormat(format!("field '{key}' must be an unsigned integer")))
}

/// Parse a UTF-8 JSON file into a [`Value`].
pub(crate) fn parse_file(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).map_err(|e| {
        DrmError::BadArgument(format!("cannot read file '{}': {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        DrmError::BadFormat(format!("cannot parse JSON file '{}': {e}", path.display()))
    })
}

/// Write a [`Value`] as pretty-printed JSON, atomically (write-then-rename).
pub(crate) fn save_file_atomic(path: &Path, value: &Value) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| DrmError::BadFormat(format!("cannot serialize JSON: {e}")))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| {
        DrmError::BadArgument(format!("cannot write file '{}': {e}", tmp.display()))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        DrmError::BadArgument(format!("cannot rename '{}': {e}", tmp.display()))
    })
}
