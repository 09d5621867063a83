//! Deterministic hashing for descriptors and payloads using BLAKE3

use crate::types::Hash;
use blake3::Hasher;
use serde_json::Value;

/// Discriminator for descriptor hashes so a query and a context with the same
/// name and params never share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Query,
    Context,
}

impl DescriptorKind {
    fn tag(self) -> &'static [u8] {
        match self {
            DescriptorKind::Query => b"query",
            DescriptorKind::Context => b"context",
        }
    }
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(number) => write_number(number, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Whole-number floats render as integers, so `1.0` and `1` agree.
fn write_number(number: &serde_json::Number, out: &mut String) {
    if let Some(float) = number.as_f64().filter(|_| number.is_f64()) {
        // 2^63 bounds the exactly representable i64 range
        const LIMIT: f64 = 9_223_372_036_854_775_808.0;
        if float.is_finite() && float.fract() == 0.0 && (-LIMIT..LIMIT).contains(&float) {
            out.push_str(&(float as i64).to_string());
            return;
        }
    }
    out.push_str(&number.to_string());
}

/// Compute the hash identifying a named, parameterized descriptor
///
/// hash = H(kind || name_len || name || ("undefined" | "value:" || canonical(params)))
///
/// Absent params and an empty object hash differently.
pub fn compute_descriptor_hash(kind: DescriptorKind, name: &str, params: Option<&Value>) -> Hash {
    let mut hasher = Hasher::new();

    hasher.update(kind.tag());

    // Name length (8 bytes, big-endian) keeps name/params boundaries unambiguous
    hasher.update(&(name.len() as u64).to_be_bytes());
    hasher.update(name.as_bytes());

    match params {
        None => {
            hasher.update(b"undefined");
        }
        Some(params) => {
            hasher.update(b"value:");
            hasher.update(canonical_json(params).as_bytes());
        }
    }

    *hasher.finalize().as_bytes()
}

/// Compute the content hash of a delivered payload
pub fn compute_payload_hash(payload: &Value) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(canonical_json(payload).as_bytes());
    *hasher.finalize().as_bytes()
}
