//! Canonical hashing of structured packets.
//!
//! Keys are sorted at every depth (including inside lists of rows), output is
//! compact JSON with no insignificant whitespace, and binary floats are
//! refused outright so the digest only depends on content.
use crate::error::{RejectCode, RejectContext, Result, StoreError};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Which packet hash to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// Excludes free-text fields so remarks do not change the judged identity.
    Identity,
    /// Covers every field; used for change detection and audit.
    Full,
}

/// Serialize `value` into its canonical byte form.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_canonical(value, &mut out, "$")?;
    Ok(out)
}

/// Hash `value` after dropping `exclude`d keys from the top-level object.
pub fn canonical_hash(value: &Value, exclude: &BTreeSet<String>) -> Result<String> {
    let bytes = match value {
        Value::Object(map) if !exclude.is_empty() => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !exclude.contains(key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            canonical_bytes(&Value::Object(filtered))?
        }
        _ => canonical_bytes(value)?,
    };
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a packet in the given mode; `free_text` only applies to `Identity`.
pub fn packet_hash(packet: &Value, mode: HashMode, free_text: &BTreeSet<String>) -> Result<String> {
    match mode {
        HashMode::Identity => canonical_hash(packet, free_text),
        HashMode::Full => canonical_hash(packet, &BTreeSet::new()),
    }
}

fn write_canonical(value: &Value, out: &mut Vec<u8>, at: &str) -> Result<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => write_scalar(value, out),
        Value::Number(number) => {
            if number.is_f64() {
                return Err(StoreError::reject(
                    RejectCode::InvalidNumber,
                    RejectContext::new(format!(
                        "binary float {number} cannot be hashed canonically"
                    ))
                    .subject(at),
                ));
            }
            write_scalar(value, out)
        }
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical(item, out, &format!("{at}[{idx}]"))?;
            }
            out.push(b']');
            Ok(())
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)
                    .map_err(|err| StoreError::serialization("canonical key", err))?;
                out.push(b':');
                write_canonical(&map[key], out, &format!("{at}.{key}"))?;
            }
            out.push(b'}');
            Ok(())
        }
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *out, value)
        .map_err(|err| StoreError::serialization("canonical scalar", err))
}
