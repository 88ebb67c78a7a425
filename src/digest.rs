//! Structural digests of values.
//!
//! Canonical (frozen, admitted) values support a deterministic 256-bit
//! content digest: the value graph is linearized with positional
//! back-references — the same cycle-safe scheme canonical traces use — and
//! hashed with SHA-256 under domain separation and length prefixing, so a
//! digest from one domain can never be confused with a digest from another.
//!
//! Two admitted values that are deeply equal share a representative and
//! therefore a digest. The digest is purely structural, so it is also equal
//! across *distinct* cells of identical shape; identity only matters for
//! opaque cells, which contribute their visit position and nothing else.
//!
//! # Citations
//! - SHA-256: NIST FIPS 180-4 (2015)
//! - Domain separation & length prefixing: Bernstein et al., "How to hash
//!   into elliptic curves" (2009)

use crate::value::{Body, Prim, Slot, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A 256-bit digest value.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashValue(pub [u8; 32]);

impl HashValue {
    /// The all-zero digest.
    #[inline]
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Raw bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of `data` with domain separation.
    ///
    /// The input is `b"PLM:" || domain || b":v1" || len_le64(data) || data`.
    pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"PLM:");
        hasher.update(domain);
        hasher.update(b":v1");
        hasher.update((data.len() as u64).to_le_bytes());
        hasher.update(data);
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for HashValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HashValue({:02x}{:02x}{:02x}{:02x}…)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Types with a deterministic canonical byte form.
pub trait CanonicalBytes {
    /// Linearizes to bytes; equal structures produce equal bytes.
    fn to_canonical_bytes(&self) -> Vec<u8>;
}

impl CanonicalBytes for Value {
    fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        let mut visited: HashMap<usize, u64> = HashMap::new();
        encode(self, &mut out, &mut visited);
        out
    }
}

/// Structural digest of a value, cycle-safe.
pub fn digest_value(value: &Value) -> HashValue {
    HashValue::hash_with_domain(b"VALUE", &value.to_canonical_bytes())
}

// Tag bytes. Primitives below 0x10, structural tags above.
const TAG_UNDEFINED: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BACKREF: u8 = 0x10;
const TAG_OBJ: u8 = 0x11;
const TAG_HOLE: u8 = 0x12;
const TAG_SLOT: u8 = 0x13;

const BODY_LIST: u8 = 0x20;
const BODY_RECORD: u8 = 0x21;
const BODY_BYTES: u8 = 0x22;
const BODY_DATE: u8 = 0x23;
const BODY_ERROR: u8 = 0x24;
const BODY_REGEX: u8 = 0x25;
const BODY_BOXED_NUM: u8 = 0x26;
const BODY_BOXED_BOOL: u8 = 0x27;
const BODY_BOXED_STR: u8 = 0x28;
const BODY_SET: u8 = 0x29;
const BODY_MAP: u8 = 0x2a;
const BODY_FUNC: u8 = 0x2b;
const BODY_OPAQUE: u8 = 0x2c;

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

/// Float bits with one NaN and positive zero, matching key equality.
fn put_float(out: &mut Vec<u8>, x: f64) {
    let bits = if x.is_nan() {
        f64::NAN.to_bits()
    } else if x == 0.0 {
        0u64
    } else {
        x.to_bits()
    };
    out.extend_from_slice(&bits.to_le_bytes());
}

fn encode(value: &Value, out: &mut Vec<u8>, visited: &mut HashMap<usize, u64>) {
    match value {
        Value::Prim(Prim::Undefined) => out.push(TAG_UNDEFINED),
        Value::Prim(Prim::Null) => out.push(TAG_NULL),
        Value::Prim(Prim::Bool(b)) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Prim(Prim::Int(i)) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Prim(Prim::Float(x)) => {
            out.push(TAG_FLOAT);
            put_float(out, *x);
        }
        Value::Prim(Prim::Str(s)) => {
            out.push(TAG_STR);
            put_str(out, s);
        }
        Value::Obj(obj) => {
            if let Some(&index) = visited.get(&obj.addr()) {
                out.push(TAG_BACKREF);
                out.extend_from_slice(&index.to_le_bytes());
                return;
            }
            let index = visited.len() as u64;
            visited.insert(obj.addr(), index);
            out.push(TAG_OBJ);
            out.extend_from_slice(&obj.class().as_u32().to_le_bytes());
            encode_body(&obj.body(), out, visited);
        }
    }
}

fn encode_body(body: &Body, out: &mut Vec<u8>, visited: &mut HashMap<usize, u64>) {
    match body {
        Body::List(slots) => {
            out.push(BODY_LIST);
            put_len(out, slots.len());
            for slot in slots {
                match slot {
                    Slot::Hole => out.push(TAG_HOLE),
                    Slot::Val(v) => {
                        out.push(TAG_SLOT);
                        encode(v, out, visited);
                    }
                }
            }
        }
        Body::Record(record) => {
            out.push(BODY_RECORD);
            let mut keys: Vec<_> = record.keys().cloned().collect();
            keys.sort();
            put_len(out, keys.len());
            for key in keys {
                put_str(out, &key);
                encode(
                    record.get(&key).expect("key present"),
                    out,
                    visited,
                );
            }
        }
        Body::Bytes(bytes) => {
            out.push(BODY_BYTES);
            put_len(out, bytes.len());
            out.extend_from_slice(bytes);
        }
        Body::Date(ms) => {
            out.push(BODY_DATE);
            put_float(out, *ms);
        }
        Body::Error { name, message } => {
            out.push(BODY_ERROR);
            put_str(out, name);
            put_str(out, message);
        }
        Body::Regex(source) => {
            out.push(BODY_REGEX);
            put_str(out, source);
        }
        Body::BoxedNum(x) => {
            out.push(BODY_BOXED_NUM);
            put_float(out, *x);
        }
        Body::BoxedBool(b) => {
            out.push(BODY_BOXED_BOOL);
            out.push(*b as u8);
        }
        Body::BoxedStr(s) => {
            out.push(BODY_BOXED_STR);
            put_str(out, s);
        }
        Body::Set(members) => {
            out.push(BODY_SET);
            put_len(out, members.len());
            for member in members.iter() {
                encode(member, out, visited);
            }
        }
        Body::Map(entries) => {
            out.push(BODY_MAP);
            put_len(out, entries.len());
            for (key, value) in entries.iter() {
                encode(key, out, visited);
                encode(value, out, visited);
            }
        }
        Body::Func(func) => {
            out.push(BODY_FUNC);
            out.push(func.native as u8);
            match &func.source {
                Some(source) => {
                    out.push(1);
                    put_str(out, source);
                }
                None => out.push(0),
            }
        }
        Body::Opaque(_) => {
            // Identity only: the visit index recorded by the caller is all
            // the structure an opaque cell contributes.
            out.push(BODY_OPAQUE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use std::rc::Rc;

    fn record(pairs: &[(&str, Value)]) -> Obj {
        Obj::record(pairs.iter().map(|(k, v)| (Rc::from(*k), v.clone())))
    }

    #[test]
    fn equal_structure_equal_digest() {
        let a = record(&[("x", Value::int(1)), ("y", Value::str("s"))]);
        let b = record(&[("y", Value::str("s")), ("x", Value::int(1))]);
        assert_eq!(digest_value(&a.into()), digest_value(&b.into()));
    }

    #[test]
    fn different_structure_different_digest() {
        let a = record(&[("x", Value::int(1))]);
        let b = record(&[("x", Value::int(2))]);
        assert_ne!(digest_value(&a.into()), digest_value(&b.into()));
        assert_ne!(
            digest_value(&Obj::list([Value::undefined()]).into()),
            digest_value(&Obj::list_with_holes([crate::value::Slot::Hole]).into())
        );
    }

    #[test]
    fn cycles_terminate() {
        let a = record(&[("v", Value::int(1))]);
        a.record_set("next", Value::from(a.clone())).unwrap();
        let b = record(&[("v", Value::int(1))]);
        b.record_set("next", Value::from(b.clone())).unwrap();
        assert_eq!(
            digest_value(&a.clone().into()),
            digest_value(&b.into())
        );
        // Shared structure digests differently from a cycle.
        let c = record(&[("v", Value::int(1))]);
        let d = record(&[("v", Value::int(1)), ("next", Value::from(c.clone()))]);
        c.record_set("next", Value::from(record(&[]))).unwrap();
        assert_ne!(digest_value(&a.into()), digest_value(&d.into()));
    }

    #[test]
    fn float_normalization_matches_equality() {
        assert_eq!(
            digest_value(&Obj::boxed_num(f64::NAN).into()),
            digest_value(&Obj::boxed_num(f64::from_bits(0x7ff8_0000_0000_0001)).into())
        );
        assert_eq!(
            digest_value(&Value::float(0.0)),
            digest_value(&Value::float(-0.0))
        );
    }

    #[test]
    fn domain_separation_distinguishes() {
        let bytes = b"same payload";
        assert_ne!(
            HashValue::hash_with_domain(b"A", bytes),
            HashValue::hash_with_domain(b"B", bytes)
        );
        assert_eq!(
            HashValue::hash_with_domain(b"A", bytes),
            HashValue::hash_with_domain(b"A", bytes)
        );
    }
}
