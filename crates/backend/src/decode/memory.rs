//! Memory layout: one word per element or field, reference-typed members held as pointers.

use super::{abi::decode_bytes, value::Value, word::decode_word, Limits};
use crate::{
    artifact::types::{DataLocation, TypeDesc},
    utils::bytes::{read_usize, read_word},
};

/// Decodes `ty` stored at `address`. Returns the value and the bytes it occupies there.
///
/// A pointer occupies one word and is followed to its target; a bare reference type is its
/// own content.
pub fn decode(
    ty: &TypeDesc,
    address: usize,
    memory: &[u8],
    limits: &Limits,
) -> Option<(Value, usize)> {
    match ty {
        TypeDesc::Pointer { to, location: DataLocation::Memory } => {
            let target = read_usize(memory, address)?;
            let (value, _) = decode(to, target, memory, limits)?;
            Some((value, 32))
        }
        // Memory never points into other spaces.
        TypeDesc::Pointer { .. } | TypeDesc::Mapping { .. } => None,
        TypeDesc::Bytes | TypeDesc::String => {
            let len = read_usize(memory, address)?;
            let value = decode_bytes(ty, address.checked_add(32)?, len, memory, limits)?;
            Some((value, 32 + len.div_ceil(32) * 32))
        }
        TypeDesc::Array { elem, size: Some(n) } => {
            let items = decode_words(elem, *n, address, memory, limits)?;
            Some((Value::Array(items), n * 32))
        }
        TypeDesc::Array { elem, size: None } => {
            let n = read_usize(memory, address)?;
            let items = decode_words(elem, n, address.checked_add(32)?, memory, limits)?;
            Some((Value::Array(items), 32 + n * 32))
        }
        TypeDesc::Struct { fields, .. } => {
            let mut values = Vec::with_capacity(fields.len());
            let mut at = address;
            for (name, field) in fields {
                let (value, _) = decode(field, at, memory, limits)?;
                values.push((name.clone(), value));
                at = at.checked_add(32)?;
            }
            Some((Value::Struct(values), fields.len() * 32))
        }
        ty => Some((decode_word(ty, &read_word(memory, address)?)?, 32)),
    }
}

/// Decodes `n` elements of one word each, starting at `address`.
fn decode_words(
    elem: &TypeDesc,
    n: usize,
    address: usize,
    memory: &[u8],
    limits: &Limits,
) -> Option<Vec<Value>> {
    if n > limits.max_array_length || n.checked_mul(32)? > memory.len() {
        trace!(n, "array length exceeds the configured limit or memory");
        return None;
    }
    (0..n)
        .map(|i| {
            let at = address.checked_add(i * 32)?;
            decode(elem, at, memory, limits).map(|(value, _)| value)
        })
        .collect()
}
