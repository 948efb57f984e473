//! Values held on the operand stack.
//!
//! A multi-word value starts at its `offset_from_top` and continues towards the top, so its
//! second word sits at `offset_from_top - 1`.

use alloy_primitives::{Address, FixedBytes, B256, U256};

use super::{
    abi::{self, decode_bytes, decode_elements},
    memory, storage,
    value::Value,
    word::decode_word,
    DecodeContext, StorageCursor,
};
use crate::{
    artifact::types::{DataLocation, TypeDesc},
    utils::bytes::to_usize,
};

/// Stack words a value of `ty` occupies.
///
/// External function pointers are an address and a selector. Call data pointers to dynamic
/// arrays, `bytes` and `string` carry their length in a second word.
pub fn stack_words(ty: &TypeDesc) -> usize {
    match ty {
        TypeDesc::Function { external: true } => 2,
        TypeDesc::Pointer { to, location: DataLocation::CallData } if has_inline_length(to) => 2,
        _ => 1,
    }
}

fn has_inline_length(ty: &TypeDesc) -> bool {
    matches!(ty, TypeDesc::Bytes | TypeDesc::String | TypeDesc::Array { size: None, .. })
}

/// Word `offset` positions below the top of `stack`.
pub fn peek(stack: &[U256], offset: usize) -> Option<U256> {
    let index = stack.len().checked_sub(offset.checked_add(1)?)?;
    stack.get(index).copied()
}

/// Decodes `ty` at `offset_from_top`. Returns the value and the number of words it occupies.
pub fn decode(
    ty: &TypeDesc,
    offset_from_top: usize,
    ctx: &DecodeContext<'_>,
) -> Option<(Value, usize)> {
    let first = peek(ctx.stack, offset_from_top)?;
    let value = match ty {
        TypeDesc::Function { external: true } => {
            let selector = peek(ctx.stack, offset_from_top.checked_sub(1)?)?;
            let selector = B256::from(selector);
            Value::Function {
                address: Address::from_word(B256::from(first)),
                selector: FixedBytes::from_slice(&selector[28..]),
            }
        }
        TypeDesc::Pointer { to, location } => {
            decode_pointer(to, *location, first, offset_from_top, ctx)?
        }
        ty if ty.is_value_type() => decode_word(ty, &B256::from(first))?,
        _ => {
            trace!(%ty, "reference type held on the stack without a pointer");
            return None;
        }
    };
    Some((value, stack_words(ty)))
}

fn decode_pointer(
    to: &TypeDesc,
    location: DataLocation,
    pointer: U256,
    offset_from_top: usize,
    ctx: &DecodeContext<'_>,
) -> Option<Value> {
    match location {
        DataLocation::Memory => {
            memory::decode(to, to_usize(pointer)?, ctx.memory, &ctx.limits).map(|(value, _)| value)
        }
        DataLocation::Storage => {
            storage::decode(to, StorageCursor::new(pointer), &ctx.storage_context())
                .map(|(value, _)| value)
        }
        DataLocation::CallData if has_inline_length(to) => {
            // The pointer addresses the first element; the length is the next word up.
            let start = to_usize(pointer)?;
            let len = to_usize(peek(ctx.stack, offset_from_top.checked_sub(1)?)?)?;
            match to {
                TypeDesc::Array { elem, .. } => {
                    decode_elements(elem, len, start, ctx.calldata, &ctx.limits).map(Value::Array)
                }
                _ => decode_bytes(to, start, len, ctx.calldata, &ctx.limits),
            }
        }
        DataLocation::CallData => {
            abi::decode_content(to, to_usize(pointer)?, ctx.calldata, &ctx.limits)
        }
    }
}
