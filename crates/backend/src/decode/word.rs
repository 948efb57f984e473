//! Value types from raw words and packed storage bytes.

use alloy_primitives::{Address, FixedBytes, B256, I256, U256};

use super::value::Value;
use crate::artifact::types::TypeDesc;

/// Decodes a value type from its packed bytes (`bytes.len()` equals the packed size).
///
/// Fixed bytes and external function pointers are stored in byte order; everything else is a
/// big-endian integer.
pub fn decode_packed(ty: &TypeDesc, bytes: &[u8]) -> Option<Value> {
    if Some(bytes.len()) != ty.packed_size() {
        return None;
    }

    match ty {
        TypeDesc::Bool => Some(Value::Bool(bytes[0] != 0)),
        TypeDesc::Uint(bits) => Some(Value::Uint(U256::try_from_be_slice(bytes)?, *bits)),
        TypeDesc::Int(bits) => {
            let raw = U256::try_from_be_slice(bytes)?;
            Some(Value::Int(sign_extend(raw, *bits), *bits))
        }
        TypeDesc::Address => Some(Value::Address(Address::from_slice(bytes))),
        TypeDesc::FixedBytes(n) => {
            let mut word = B256::ZERO;
            word[..bytes.len()].copy_from_slice(bytes);
            Some(Value::FixedBytes(word, *n))
        }
        TypeDesc::Enum { members, .. } => {
            Some(Value::Uint(U256::try_from_be_slice(bytes)?, TypeDesc::enum_bits(members.len())))
        }
        TypeDesc::Function { external: true } => Some(Value::Function {
            address: Address::from_slice(&bytes[..20]),
            selector: FixedBytes::from_slice(&bytes[20..24]),
        }),
        TypeDesc::Function { external: false } => {
            Some(Value::Uint(U256::try_from_be_slice(bytes)?, 64))
        }
        _ => None,
    }
}

/// Decodes a value type held in a full word (stack, memory, ABI encoding).
///
/// Fixed bytes and external function pointers are left-aligned, the rest right-aligned;
/// dirty bits outside the type's width are ignored.
pub fn decode_word(ty: &TypeDesc, word: &B256) -> Option<Value> {
    let size = ty.packed_size()?;
    if !ty.is_value_type() {
        return None;
    }
    let bytes = match ty {
        TypeDesc::FixedBytes(_) | TypeDesc::Function { external: true } => &word[..size],
        _ => &word[32 - size..],
    };
    decode_packed(ty, bytes)
}

/// Sign-extends the low `bits` bits of `raw`.
fn sign_extend(raw: U256, bits: u16) -> I256 {
    let value = if bits >= 256 {
        raw
    } else {
        let bits = bits as usize;
        let mask = (U256::from(1) << bits) - U256::from(1);
        let low = raw & mask;
        if low.bit(bits - 1) {
            low | !mask
        } else {
            low
        }
    };
    let value = I256::from_raw(value);
    debug_assert!(fits_signed(value, bits), "sign extension produced an out-of-range value");
    value
}

fn fits_signed(value: I256, bits: u16) -> bool {
    if bits >= 256 {
        return true;
    }
    let bound = I256::from_raw(U256::from(1) << (bits as usize - 1));
    value >= -bound && value < bound
}
