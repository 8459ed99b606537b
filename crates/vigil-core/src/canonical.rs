//! Canonical JSON serialization and content hashing.
//!
//! Canonical form is minimal JSON with object keys sorted lexicographically
//! (byte order) and no whitespace, so that equivalent values always hash
//! identically. Evidence hashes, audit chain hashes, and the merged-config
//! hash recorded in `run_start` all go through this module.
//!
//! Unlike a wire-format canonicalizer this profile accepts floats: sensor
//! `details` are free-form and may carry fractional values. Floats are
//! emitted with `serde_json`'s shortest-round-trip formatting, which is
//! deterministic for a given value.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Serializes a JSON value to canonical form.
#[must_use]
pub fn to_canonical_string(value: &Value) -> String {
    let mut output = String::new();
    emit_value(value, &mut output);
    output
}

/// SHA-256 over arbitrary bytes, as lowercase hex.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// SHA-256 over the canonical serialization of a JSON value, as hex.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    sha256_hex(to_canonical_string(value).as_bytes())
}

/// SHA-256 over the canonical serialization of a details map, as hex.
#[must_use]
pub fn hash_details(details: &Map<String, Value>) -> String {
    hash_value(&Value::Object(details.clone()))
}

fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => {
            output.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                emit_value(item, output);
            }
            output.push(']');
        }
        Value::Object(obj) => emit_object(obj, output),
    }
}

fn emit_number(n: &Number, output: &mut String) {
    // serde_json renders integers plainly and floats via shortest
    // round-trip; both are stable for equal inputs.
    let _ = write!(output, "{n}");
}

/// Minimal escaping per RFC 8785 §3.2.2.2: only `"`, `\`, and control
/// characters U+0000..=U+001F are escaped.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            }
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_object(obj: &Map<String, Value>, output: &mut String) {
    let mut keys: Vec<&String> = obj.keys().collect();
    keys.sort();

    output.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output);
    }
    output.push('}');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_keys_sorted_and_whitespace_free() {
        let v = json!({"z": 1, "a": 2, "m": {"y": true, "x": null}});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":2,"m":{"x":null,"y":true},"z":1}"#
        );
    }

    #[test]
    fn test_arrays_preserve_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(to_canonical_string(&v), "[3,1,2]");
    }

    #[test]
    fn test_escapes_controls_and_quotes() {
        let v = json!({"text": "a\"b\\c\nd\u{0001}"});
        assert_eq!(to_canonical_string(&v), r#"{"text":"a\"b\\c\nd\u0001"}"#);
    }

    #[test]
    fn test_floats_accepted() {
        let v = json!({"altitude_ft": 350.5});
        assert_eq!(to_canonical_string(&v), r#"{"altitude_ft":350.5}"#);
    }

    #[test]
    fn test_hash_independent_of_key_order() {
        let a = json!({"scan_count": 25, "track_id": "t"});
        let b = json!({"track_id": "t", "scan_count": 25});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("") is a fixed constant.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_canonical_is_idempotent() {
        let v = json!({"b": [1, {"d": 2, "c": 3}], "a": "x"});
        let once = to_canonical_string(&v);
        let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
        assert_eq!(once, to_canonical_string(&reparsed));
    }
}
