//! ABI-encoded data: call data, return data and log payloads.

use alloy_primitives::Bytes;

use super::{value::Value, word::decode_word, Limits};
use crate::{
    artifact::types::TypeDesc,
    utils::bytes::{read_slice, read_usize, read_word},
};

/// Decodes the value whose head starts at `head`.
///
/// Offsets of dynamic types are relative to `base`, the start of the enclosing tuple.
/// Returns the value and the size of its head in bytes.
pub fn decode(
    ty: &TypeDesc,
    head: usize,
    base: usize,
    data: &[u8],
    limits: &Limits,
) -> Option<(Value, usize)> {
    if let TypeDesc::Pointer { to, .. } = ty {
        return decode(to, head, base, data, limits);
    }

    if ty.is_abi_dynamic() {
        let offset = read_usize(data, head)?;
        let start = base.checked_add(offset)?;
        return Some((decode_content(ty, start, data, limits)?, 32));
    }
    Some((decode_content(ty, head, data, limits)?, ty.abi_head_size()?))
}

/// Decodes the encoding of `ty` that starts at `start` (past any offset indirection).
pub fn decode_content(ty: &TypeDesc, start: usize, data: &[u8], limits: &Limits) -> Option<Value> {
    match ty {
        TypeDesc::Pointer { to, .. } => decode_content(to, start, data, limits),
        TypeDesc::Bytes | TypeDesc::String => {
            let len = read_usize(data, start)?;
            decode_bytes(ty, start.checked_add(32)?, len, data, limits)
        }
        TypeDesc::Array { elem, size: Some(n) } => {
            decode_elements(elem, *n, start, data, limits).map(Value::Array)
        }
        TypeDesc::Array { elem, size: None } => {
            let n = read_usize(data, start)?;
            decode_elements(elem, n, start.checked_add(32)?, data, limits).map(Value::Array)
        }
        TypeDesc::Struct { fields, .. } => {
            let mut head = start;
            let mut values = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                let (value, size) = decode(field, head, start, data, limits)?;
                values.push((name.clone(), value));
                head = head.checked_add(size)?;
            }
            Some(Value::Struct(values))
        }
        TypeDesc::Mapping { .. } => None,
        ty => decode_word(ty, &read_word(data, start)?),
    }
}

/// Decodes the `len` content bytes of a `bytes` or `string` value starting at `start`.
pub(crate) fn decode_bytes(
    ty: &TypeDesc,
    start: usize,
    len: usize,
    data: &[u8],
    limits: &Limits,
) -> Option<Value> {
    if len > limits.max_bytes_length {
        trace!(len, "byte array length exceeds the configured limit");
        return None;
    }
    let bytes = read_slice(data, start, len)?;
    match ty {
        TypeDesc::String => Some(Value::String(String::from_utf8_lossy(bytes).into_owned())),
        _ => Some(Value::Bytes(Bytes::copy_from_slice(bytes))),
    }
}

/// Decodes `n` consecutive elements forming a tuple that starts at `base`.
pub(crate) fn decode_elements(
    elem: &TypeDesc,
    n: usize,
    base: usize,
    data: &[u8],
    limits: &Limits,
) -> Option<Vec<Value>> {
    let head_size = elem.abi_head_size()?;
    // Every element needs at least its head inside the data.
    if n > limits.max_array_length || n.checked_mul(head_size)? > data.len() {
        trace!(n, "array length exceeds the configured limit or the data");
        return None;
    }

    let mut values = Vec::with_capacity(n);
    let mut head = base;
    for _ in 0..n {
        let (value, size) = decode(elem, head, base, data, limits)?;
        values.push(value);
        head = head.checked_add(size)?;
    }
    Some(values)
}

/// Decodes each member of a tuple starting at `base`; members fail independently.
pub fn decode_tuple(
    types: &[TypeDesc],
    base: usize,
    data: &[u8],
    limits: &Limits,
) -> Vec<Option<Value>> {
    let mut head = Some(base);
    types
        .iter()
        .map(|ty| {
            let at = head?;
            head = ty.abi_head_size().and_then(|size| at.checked_add(size));
            decode(ty, at, base, data, limits).map(|(value, _)| value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};
    use alloy_sol_types::SolValue;
    use proptest::prelude::*;

    use crate::decode::testing::signed_int;

    fn uint() -> TypeDesc {
        TypeDesc::Uint(256)
    }

    fn dyn_array(elem: TypeDesc) -> TypeDesc {
        TypeDesc::Array { elem: Box::new(elem), size: None }
    }

    fn fixed_array(elem: TypeDesc, n: usize) -> TypeDesc {
        TypeDesc::Array { elem: Box::new(elem), size: Some(n) }
    }

    fn uints(values: &[U256]) -> Value {
        Value::Array(values.iter().map(|v| Value::Uint(*v, 256)).collect())
    }

    #[test]
    fn test_nested_arrays() {
        let nested = vec![vec![U256::from(1), U256::from(2)], vec![], vec![U256::from(3)]];
        let fixed = [[U256::from(4), U256::from(5)], [U256::from(6), U256::from(7)]];
        let data = (nested.clone(), fixed).abi_encode_params();

        let types = [dyn_array(dyn_array(uint())), fixed_array(fixed_array(uint(), 2), 2)];
        let decoded = decode_tuple(&types, 0, &data, &Limits::default());

        let expected_nested = Value::Array(nested.iter().map(|v| uints(v)).collect());
        let expected_fixed = Value::Array(fixed.iter().map(|v| uints(v)).collect());
        assert_eq!(decoded, vec![Some(expected_nested), Some(expected_fixed)]);
    }

    #[test]
    fn test_struct_with_dynamic_field() {
        // struct { uint256 a; string b; }[] followed by a bool
        let items = vec![(U256::from(9), "nine".to_string()), (U256::ZERO, String::new())];
        let data = (items.clone(), true).abi_encode_params();

        let item = TypeDesc::Struct {
            name: "S".to_string(),
            fields: vec![("a".to_string(), uint()), ("b".to_string(), TypeDesc::String)],
        };
        let decoded = decode_tuple(&[dyn_array(item), TypeDesc::Bool], 0, &data, &Limits::default());

        let expected = Value::Array(
            items
                .into_iter()
                .map(|(a, b)| {
                    Value::Struct(vec![
                        ("a".to_string(), Value::Uint(a, 256)),
                        ("b".to_string(), Value::String(b)),
                    ])
                })
                .collect(),
        );
        assert_eq!(decoded, vec![Some(expected), Some(Value::Bool(true))]);
    }

    #[test]
    fn test_oversized_lengths_are_undefined() {
        let data = (Bytes::from(vec![7u8; 64]), vec![U256::from(1); 3]).abi_encode_params();
        let limits = Limits { max_array_length: 2, max_bytes_length: 63 };
        assert_eq!(
            decode_tuple(&[TypeDesc::Bytes, dyn_array(uint())], 0, &data, &limits),
            vec![None, None]
        );

        // a claimed length far past the end of the data
        let mut forged = U256::from(32).to_be_bytes::<32>().to_vec();
        forged.extend(U256::from(1_000_000u64).to_be_bytes::<32>());
        assert_eq!(decode(&dyn_array(uint()), 0, 0, &forged, &Limits::default()), None);
    }

    #[test]
    fn test_tuple_members_fail_independently() {
        let data = (Address::repeat_byte(1), U256::MAX).abi_encode_params();
        let decoded = decode_tuple(
            &[TypeDesc::Address, TypeDesc::Mapping { key: Box::new(uint()), value: Box::new(uint()) }, uint()],
            0,
            &data,
            &Limits::default(),
        );
        // the mapping has no head size, so nothing after it can be placed
        assert_eq!(decoded, vec![Some(Value::Address(Address::repeat_byte(1))), None, None]);
    }

    proptest! {
        #[test]
        fn roundtrip_calldata(
            n in any::<[u8; 32]>(),
            addr in any::<[u8; 20]>(),
            flag in any::<bool>(),
            text in prop::sample::select(vec![0usize, 1, 31, 32, 33, 1000])
                .prop_flat_map(|len| proptest::string::string_regex(&format!(".{{{len}}}")).unwrap()),
            blob in prop::sample::select(vec![0usize, 1, 31, 32, 33, 1000])
                .prop_flat_map(|len| prop::collection::vec(any::<u8>(), len)),
            list in prop::collection::vec(any::<[u8; 32]>(), 0..5),
        ) {
            let n = U256::from_be_bytes(n);
            let addr = Address::from(addr);
            let list: Vec<U256> = list.into_iter().map(U256::from_be_bytes).collect();
            let data = (n, addr, flag, text.clone(), Bytes::from(blob.clone()), list.clone())
                .abi_encode_params();

            let types = [
                uint(),
                TypeDesc::Address,
                TypeDesc::Bool,
                TypeDesc::String,
                TypeDesc::Bytes,
                dyn_array(uint()),
            ];
            let decoded = decode_tuple(&types, 0, &data, &Limits::default());
            prop_assert_eq!(decoded, vec![
                Some(Value::Uint(n, 256)),
                Some(Value::Address(addr)),
                Some(Value::Bool(flag)),
                Some(Value::String(text)),
                Some(Value::Bytes(Bytes::from(blob))),
                Some(uints(&list)),
            ]);
        }

        #[test]
        fn roundtrip_narrow_integers(bits in (1u16..=32).prop_map(|b| b * 8), raw in any::<[u8; 32]>()) {
            let raw = U256::from_be_bytes(raw);
            let mask = if bits == 256 { U256::MAX } else { (U256::from(1) << bits as usize) - U256::from(1) };
            let value = raw & mask;
            let data = value.abi_encode();
            let decoded = decode(&TypeDesc::Uint(bits), 0, 0, &data, &Limits::default());
            prop_assert_eq!(decoded, Some((Value::Uint(value, bits), 32)));
        }

        #[test]
        fn roundtrip_signed_integers((bits, value) in signed_int()) {
            let data = value.abi_encode();
            let decoded = decode(&TypeDesc::Int(bits), 0, 0, &data, &Limits::default());
            prop_assert_eq!(decoded, Some((Value::Int(value, bits), 32)));
        }
    }
}
