//! Canonical hashing for the evaluation ledger.
//!
//! Every content hash in the system flows through this module: block
//! hashes, Merkle leaves, signature hashes, audit event hashes, and the
//! approval proofs produced by the multi-signature engine. All of them
//! hash the **canonical JSON** form of their payload with SHA-256, so a
//! single serialization routine ([`canonical_json`]) defines integrity
//! for the whole system. Divergence here breaks integrity silently,
//! which is why nothing else in the crate is allowed to hand-roll its
//! own JSON-for-hashing.
//!
//! Canonical form: lexicographically sorted object keys, no
//! insignificant whitespace, UTF-8 input with all non-ASCII characters
//! escaped as `\uXXXX`, and serde_json's numeric formatting (which
//! keeps `68.0` distinct from `68`).

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::HexHash;

pub mod merkle;
pub mod zkp;

pub use merkle::merkle_root;
pub use zkp::{HashCommitmentZkp, ZkProof, ZkpEngine};

type HmacSha256 = Hmac<Sha256>;

/// Serializes a JSON value into its canonical textual form.
///
/// Object keys are emitted in lexicographic order regardless of the
/// insertion order of the underlying map, arrays keep their order, and
/// every non-ASCII character is escaped so the output is plain ASCII.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(s, out),
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
        Value::Object(map) => {
            // Sort keys for a stable form; the in-memory map may be
            // insertion-ordered (preserve_order) but hashing must not
            // depend on that.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Writes a JSON string literal with ASCII-only escaping.
fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if c.is_ascii() => out.push(c),
            c => {
                // Escape astral-plane characters as surrogate pairs,
                // everything else as a single \uXXXX unit.
                let cp = c as u32;
                if cp > 0xFFFF {
                    let v = cp - 0x10000;
                    let hi = 0xD800 + (v >> 10);
                    let lo = 0xDC00 + (v & 0x3FF);
                    out.push_str(&format!("\\u{hi:04x}\\u{lo:04x}"));
                } else {
                    out.push_str(&format!("\\u{cp:04x}"));
                }
            }
        }
    }
    out.push('"');
}

/// SHA-256 over raw bytes, returned as a lowercase hex digest.
pub fn hash_bytes(data: &[u8]) -> HexHash {
    let digest = Sha256::digest(data);
    HexHash::from_digest(&digest)
}

/// SHA-256 over a UTF-8 string.
pub fn hash_str(data: &str) -> HexHash {
    hash_bytes(data.as_bytes())
}

/// SHA-256 over the canonical JSON form of a value.
///
/// This is the hash every structured payload in the system uses; it is
/// the Rust counterpart of hashing `json.dumps(x, sort_keys=True)`.
pub fn hash_value(value: &Value) -> HexHash {
    hash_str(&canonical_json(value))
}

/// HMAC-SHA256 signature over `message` with the given key, hex encoded.
pub fn hmac_sign(key: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies an HMAC-SHA256 signature in constant time.
pub fn hmac_verify(key: &str, message: &str, signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
