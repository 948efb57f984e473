//! Storage layout: packed value types, slot-aligned composites, hashed dynamic contents.

use alloy_primitives::{keccak256, Bytes, B256, U256};
use eyre::{bail, ensure, Result};

use super::{
    value::Value,
    word::{decode_packed, decode_word},
    StorageContext, StorageCursor,
};
use crate::{artifact::types::TypeDesc, utils::bytes::to_usize};

/// Number of whole slots a composite type occupies, or `1` for a value type.
pub fn storage_slots(ty: &TypeDesc) -> Option<U256> {
    match ty {
        TypeDesc::Array { elem, size: Some(n) } => {
            if let Some(size) = elem.packed_size().filter(|_| elem.is_value_type()) {
                Some(U256::from(n.div_ceil(32 / size)))
            } else {
                storage_slots(elem)?.checked_mul(U256::from(*n))
            }
        }
        TypeDesc::Struct { fields, .. } => {
            let mut cursor = StorageCursor::new(U256::ZERO);
            for (_, field) in fields {
                cursor = advance(field, cursor)?;
            }
            let end = cursor.aligned();
            Some(end.slot)
        }
        TypeDesc::Pointer { to, .. } if !to.is_value_type() => storage_slots(to),
        _ => Some(U256::from(1)),
    }
}

/// Where `ty` sits when the previous item ended at `cursor`, and where the next item may start.
///
/// For a value type the returned position's `end` is the end of the value inside its word.
pub fn place(ty: &TypeDesc, cursor: StorageCursor) -> Option<(StorageCursor, StorageCursor)> {
    if let TypeDesc::Pointer { to, .. } = ty {
        return place(to, cursor);
    }

    if ty.is_value_type() {
        let size = ty.packed_size()?;
        let at = if size > cursor.end { cursor.next_slot() } else { cursor };
        return Some((at, StorageCursor { slot: at.slot, end: at.end - size }));
    }

    let at = cursor.aligned();
    let slots = storage_slots(ty)?;
    let next = StorageCursor::new(at.slot.checked_add(slots)?);
    Some((at, next))
}

/// The cursor after `ty` is laid out at `cursor`.
pub fn advance(ty: &TypeDesc, cursor: StorageCursor) -> Option<StorageCursor> {
    place(ty, cursor).map(|(_, next)| next)
}

/// Positions of consecutive items laid out from slot zero, as state variables are.
pub fn layout(types: &[TypeDesc]) -> Option<Vec<StorageCursor>> {
    let mut cursor = StorageCursor::new(U256::ZERO);
    let mut positions = Vec::with_capacity(types.len());
    for ty in types {
        let (at, next) = place(ty, cursor)?;
        positions.push(at);
        cursor = next;
    }
    Some(positions)
}

/// Decodes `ty` laid out after `cursor`. Returns the value and the cursor for the next item.
pub fn decode(
    ty: &TypeDesc,
    cursor: StorageCursor,
    ctx: &StorageContext<'_>,
) -> Option<(Value, StorageCursor)> {
    let (at, next) = place(ty, cursor)?;
    let value = decode_at(ty, at, ctx)?;
    Some((value, next))
}

/// Decodes a mapping rooted at `slot`.
///
/// Unlike the total decoders, a missing key index is an error here.
pub fn decode_mapping(ty: &TypeDesc, slot: U256, ctx: &StorageContext<'_>) -> Result<Value> {
    let TypeDesc::Mapping { key, value } = ty else {
        bail!("{ty} is not a mapping");
    };
    ensure!(ctx.map_keys.is_some(), "decoding a mapping requires observed mapping keys");
    Ok(decode_mapping_entries(key, value, slot, ctx).unwrap_or(Value::Mapping(vec![])))
}

/// Decodes `ty` at an already placed position.
fn decode_at(ty: &TypeDesc, at: StorageCursor, ctx: &StorageContext<'_>) -> Option<Value> {
    match ty {
        TypeDesc::Pointer { to, .. } => decode_at(to, at, ctx),
        TypeDesc::Bytes | TypeDesc::String => decode_bytes(ty, at.slot, ctx),
        TypeDesc::Array { elem, size: Some(n) } => decode_elements(elem, *n, at.slot, ctx),
        TypeDesc::Array { elem, size: None } => {
            let n = to_usize(ctx.slot(at.slot))?;
            decode_elements(elem, n, hashed_slot(at.slot), ctx)
        }
        TypeDesc::Struct { fields, .. } => {
            let mut cursor = StorageCursor::new(at.slot);
            let mut values = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                let (value, next) = decode(field, cursor, ctx)?;
                values.push((name.clone(), value));
                cursor = next;
            }
            Some(Value::Struct(values))
        }
        TypeDesc::Mapping { key, value } => {
            if ctx.map_keys.is_none() {
                warn!(slot = %at.slot, "cannot enumerate a mapping without observed keys");
                return None;
            }
            decode_mapping_entries(key, value, at.slot, ctx)
        }
        ty => {
            let size = ty.packed_size()?;
            let word = B256::from(ctx.slot(at.slot));
            decode_packed(ty, &word[at.end.checked_sub(size)?..at.end])
        }
    }
}

fn decode_elements(
    elem: &TypeDesc,
    n: usize,
    slot: U256,
    ctx: &StorageContext<'_>,
) -> Option<Value> {
    if n > ctx.limits.max_array_length {
        trace!(n, "array length exceeds the configured limit");
        return None;
    }
    let mut cursor = StorageCursor::new(slot);
    let mut items = Vec::with_capacity(n);
    for _ in 0..n {
        let (value, next) = decode(elem, cursor, ctx)?;
        items.push(value);
        cursor = next;
    }
    Some(Value::Array(items))
}

/// Short values (up to 31 bytes) live in the slot itself with `2 * len` in the lowest byte;
/// long ones store `2 * len + 1` and keep their contents from `keccak256(slot)` on.
fn decode_bytes(ty: &TypeDesc, slot: U256, ctx: &StorageContext<'_>) -> Option<Value> {
    let word = ctx.slot(slot);
    let bytes = if !word.bit(0) {
        let len = word.byte(0) as usize / 2;
        if len > 31 {
            return None;
        }
        B256::from(word)[..len].to_vec()
    } else {
        let len = to_usize((word - U256::from(1)) >> 1)?;
        if len < 32 || len > ctx.limits.max_bytes_length {
            trace!(len, "invalid long byte array length");
            return None;
        }
        let start = hashed_slot(slot);
        let mut bytes = Vec::with_capacity(len.div_ceil(32) * 32);
        for i in 0..len.div_ceil(32) {
            let word = ctx.slot(start.wrapping_add(U256::from(i)));
            bytes.extend_from_slice(&word.to_be_bytes::<32>());
        }
        bytes.truncate(len);
        bytes
    };

    match ty {
        TypeDesc::String => Some(Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        _ => Some(Value::Bytes(Bytes::from(bytes))),
    }
}

/// Entries of the mapping at `slot` whose keys were observed. Undecodable entries are dropped.
fn decode_mapping_entries(
    key_ty: &TypeDesc,
    value_ty: &TypeDesc,
    slot: U256,
    ctx: &StorageContext<'_>,
) -> Option<Value> {
    let map_keys = ctx.map_keys?;
    let entries = map_keys
        .keys(slot)
        .iter()
        .filter_map(|(key, value_slot)| {
            let key = decode_key(key_ty, key)?;
            let (value, _) = decode(value_ty, StorageCursor::new(*value_slot), ctx)?;
            Some((key, value))
        })
        .collect();
    Some(Value::Mapping(entries))
}

/// Reference-typed keys are hashed as their raw bytes, value-typed keys as a padded word.
fn decode_key(ty: &TypeDesc, key: &[u8]) -> Option<Value> {
    match ty {
        TypeDesc::String => Some(Value::String(String::from_utf8_lossy(key).into_owned())),
        TypeDesc::Bytes => Some(Value::Bytes(Bytes::copy_from_slice(key))),
        ty if key.len() == 32 => decode_word(ty, &B256::from_slice(key)),
        _ => None,
    }
}

fn hashed_slot(slot: U256) -> U256 {
    U256::from_be_bytes(keccak256(slot.to_be_bytes::<32>()).0)
}
