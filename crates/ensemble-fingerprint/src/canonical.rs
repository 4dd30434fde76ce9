// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical CBOR encoder used as the hash input for simulation signatures.
//!
//! Enforces:
//! - Definite lengths only
//! - No tags
//! - Shortest integer widths
//! - Floats in the smallest width that round-trips (integral floats become integers)
//! - Map keys sorted by their encoded bytes; duplicates rejected
//! - NaN and infinities rejected (they have no stable meaning in a model definition)
//!
//! Only encoding is provided. Signatures are one-way; nothing decodes this form.

use ciborium::value::Value;
use half::f16;

/// Reasons a value has no canonical encoding.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CanonError {
    /// CBOR tags carry out-of-band semantics and are rejected.
    #[error("tagged values are not allowed")]
    Tag,
    /// NaN or an infinity appeared in a float position.
    #[error("non-finite float at {path}")]
    NonFiniteFloat {
        /// Dotted path to the offending value.
        path: String,
    },
    /// Two keys in one map encode to the same bytes.
    #[error("duplicate map key at {path}")]
    DuplicateKey {
        /// Dotted path to the map holding the duplicate.
        path: String,
    },
    /// A value kind with no canonical form (e.g. an undefined simple value).
    #[error("unsupported value at {path}")]
    Unsupported {
        /// Dotted path to the offending value.
        path: String,
    },
}

type Result<T> = std::result::Result<T, CanonError>;

/// Encode `value` canonically.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    encode_into(value, "$", &mut out)?;
    Ok(out)
}

fn encode_into(value: &Value, path: &str, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Bool(b) => out.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => out.push(0xf6),
        Value::Integer(n) => write_int(i128::from(*n), out),
        Value::Float(f) => write_float(*f, path, out)?,
        Value::Text(s) => {
            write_head(3, s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            write_head(2, b.len() as u64, out);
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            write_head(4, items.len() as u64, out);
            for (i, item) in items.iter().enumerate() {
                encode_into(item, &format!("{path}[{i}]"), out)?;
            }
        }
        Value::Map(entries) => write_map(entries, path, out)?,
        Value::Tag(_, _) => return Err(CanonError::Tag),
        _ => {
            return Err(CanonError::Unsupported {
                path: path.to_owned(),
            })
        }
    }
    Ok(())
}

fn write_map(entries: &[(Value, Value)], path: &str, out: &mut Vec<u8>) -> Result<()> {
    let mut encoded: Vec<(Vec<u8>, &Value, String)> = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let mut key_bytes = Vec::new();
        encode_into(key, path, &mut key_bytes)?;
        // Labels only feed error messages; text keys read best.
        let label = match key {
            Value::Text(k) => format!("{path}.{k}"),
            _ => format!("{path}.<key>"),
        };
        encoded.push((key_bytes, value, label));
    }
    encoded.sort_by(|a, b| a.0.cmp(&b.0));
    if encoded.windows(2).any(|pair| pair[0].0 == pair[1].0) {
        return Err(CanonError::DuplicateKey {
            path: path.to_owned(),
        });
    }

    write_head(5, encoded.len() as u64, out);
    for (key_bytes, value, label) in &encoded {
        out.extend_from_slice(key_bytes);
        encode_into(value, label, out)?;
    }
    Ok(())
}

fn write_int(n: i128, out: &mut Vec<u8>) {
    if n >= 0 {
        write_head_wide(0, n.unsigned_abs(), out);
    } else {
        // CBOR negative integers store -1 - n.
        write_head_wide(1, (-1 - n).unsigned_abs(), out);
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn write_float(f: f64, path: &str, out: &mut Vec<u8>) -> Result<()> {
    if !f.is_finite() {
        return Err(CanonError::NonFiniteFloat {
            path: path.to_owned(),
        });
    }
    if f.fract() == 0.0 {
        let i = f as i128;
        // CBOR major types 0/1 cover [-2^64, 2^64 - 1]; larger values stay floats.
        if i as f64 == f && (-(1i128 << 64)..(1i128 << 64)).contains(&i) {
            write_int(i, out);
            return Ok(());
        }
    }
    let h = f16::from_f64(f);
    if h.to_f64() == f {
        out.push(0xf9);
        out.extend_from_slice(&h.to_bits().to_be_bytes());
        return Ok(());
    }
    let single = f as f32;
    if f64::from(single) == f {
        out.push(0xfa);
        out.extend_from_slice(&single.to_be_bytes());
    } else {
        out.push(0xfb);
        out.extend_from_slice(&f.to_be_bytes());
    }
    Ok(())
}

fn write_head(major: u8, len: u64, out: &mut Vec<u8>) {
    write_head_wide(major, u128::from(len), out);
}

#[allow(clippy::cast_possible_truncation)]
fn write_head_wide(major: u8, n: u128, out: &mut Vec<u8>) {
    debug_assert!(major <= 7);
    let major = major << 5;
    match n {
        0..=23 => out.push(major | n as u8),
        24..=0xff => {
            out.push(major | 24);
            out.push(n as u8);
        }
        0x100..=0xffff => {
            out.push(major | 25);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(major | 26);
            out.extend_from_slice(&(n as u32).to_be_bytes());
        }
        _ => {
            out.push(major | 27);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
}
