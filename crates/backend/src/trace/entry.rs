//! Argument and return value views of entered functions, and event decoding.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::{
    artifact::{
        ast::NodeRef,
        contract::ContractRecord,
        types::{getter_parameters, DataLocation, TypeConverter, TypeDesc},
    },
    decode::{
        abi,
        stack::{peek, stack_words},
        word::decode_word,
        DataView, Limits, Location, Value,
    },
};

/// Views over the ABI-encoded arguments of an external entry point.
///
/// Call data carries a 4-byte selector before the arguments. Constructor arguments are
/// appended to the creation code.
pub fn external_arguments(
    record: &ContractRecord,
    callee: &NodeRef,
    converter: &TypeConverter,
) -> Vec<DataView> {
    match callee.function_kind() {
        Some("function") => {
            let params = callee
                .parameters()
                .iter()
                .enumerate()
                .map(|(i, param)| (param_name(param, i), converter.abi_parameter(param)))
                .collect::<Vec<_>>();
            DataView::abi_tuple(params, 4)
        }
        Some("constructor") => {
            let Some(base) = record.creation.as_ref().map(|code| code.template.len()) else {
                return vec![];
            };
            let params = callee
                .parameters()
                .iter()
                .enumerate()
                .map(|(i, param)| (param_name(param, i), converter.abi_parameter(param)))
                .collect::<Vec<_>>();
            DataView::abi_tuple(params, base)
        }
        // fallback and receive read raw call data
        Some(_) => vec![],
        None if callee.is_public_state_variable() => {
            let params = getter_parameters(callee, converter)
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, ty)| (format!("_{i}"), Some(ty)))
                .collect::<Vec<_>>();
            DataView::abi_tuple(params, 4)
        }
        None => vec![],
    }
}

/// Views over the stack arguments of an internal function at its entry `JUMPDEST`.
///
/// The last argument is on top of the stack.
pub fn internal_arguments(callee: &NodeRef, converter: &TypeConverter) -> Vec<DataView> {
    let params: Vec<_> = if callee.is_public_state_variable() {
        getter_parameters(callee, converter)
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, ty)| (format!("_{i}"), Some(ty)))
            .collect()
    } else {
        callee
            .parameters()
            .iter()
            .enumerate()
            .map(|(i, param)| {
                (param_name(param, i), converter.stack_variable(param, DataLocation::Memory))
            })
            .collect()
    };
    stack_views(params, 0)
}

/// Views over the values returned by an internal function, at its returning `JUMP`.
///
/// The return address is on top; the values sit right below it.
pub fn internal_returns(callee: &NodeRef, converter: &TypeConverter) -> Vec<DataView> {
    let params = callee
        .return_parameters()
        .iter()
        .enumerate()
        .map(|(i, param)| {
            (param_name(param, i), converter.stack_variable(param, DataLocation::Memory))
        })
        .collect();
    stack_views(params, 1)
}

/// Views over the ABI-encoded return data of an external entry point.
pub fn external_returns(callee: &NodeRef, converter: &TypeConverter) -> Vec<DataView> {
    if callee.is_public_state_variable() {
        return match getter_return(callee, converter) {
            Some(ty) => DataView::abi_tuple([("_0".to_string(), Some(ty))], 0),
            None => vec![],
        };
    }
    if callee.function_kind() != Some("function") {
        return vec![];
    }
    let params: Vec<_> = callee
        .return_parameters()
        .iter()
        .enumerate()
        .map(|(i, param)| (param_name(param, i), converter.abi_parameter(param)))
        .collect();
    DataView::abi_tuple(params, 0)
}

/// Walks parameters last to first, assigning stack offsets above `start`.
fn stack_views(params: Vec<(String, Option<TypeDesc>)>, start: usize) -> Vec<DataView> {
    let mut offset = start;
    let mut views: Vec<_> = params
        .into_iter()
        .rev()
        .map(|(name, ty)| {
            // An unresolved type is assumed to take a single word.
            let words = ty.as_ref().map(stack_words).unwrap_or(1);
            let location = Location::Stack { offset_from_top: offset + words - 1 };
            offset += words;
            DataView::new(name, ty, location)
        })
        .collect();
    views.reverse();
    views
}

/// Type returned by the getter of a public state variable, for value and byte array types.
fn getter_return(decl: &NodeRef, converter: &TypeConverter) -> Option<TypeDesc> {
    let mut current = decl.child("typeName")?;
    loop {
        current = match current.node_type() {
            "Mapping" => current.child("valueType")?,
            "ArrayTypeName" => current.child("baseType")?,
            _ => break,
        };
    }
    match converter.convert(&current, DataLocation::CallData, false, 0)? {
        // struct getters return the members one by one
        TypeDesc::Struct { .. } => None,
        ty => Some(ty),
    }
}

fn param_name(param: &NodeRef, index: usize) -> String {
    match param.name() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("_{index}"),
    }
}

/// A `LOGn` emitted during execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDesc {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    /// Name of the matching event declaration, if one was found.
    pub name: Option<String>,
    /// Decoded arguments of the matching declaration, in declaration order.
    pub arguments: Vec<(String, Option<Value>)>,
}

impl EventDesc {
    /// Fills in the name and arguments from the event declared under `topics[0]` by `record`.
    ///
    /// Indexed value-type arguments are read from their topic. Indexed reference types only
    /// leave their hash behind, which is kept as a `bytes32`.
    pub fn resolve(&mut self, record: &ContractRecord, converter: &TypeConverter, limits: &Limits) {
        let Some(event) = self.topics.first().and_then(|topic0| record.event(topic0)) else {
            return;
        };

        let params = event.parameters();
        let mut topics = self.topics.iter().skip(1);
        let mut data_types = vec![];
        let mut slots = Vec::with_capacity(params.len());
        for param in &params {
            let ty = converter.abi_parameter(param);
            if param.attr_bool("indexed") == Some(true) {
                let value = topics.next().and_then(|topic| match &ty {
                    Some(ty) if ty.is_value_type() => decode_word(ty, topic),
                    _ => Some(Value::FixedBytes(*topic, 32)),
                });
                slots.push(ArgumentSource::Topic(value));
            } else {
                slots.push(ArgumentSource::Data(data_types.len()));
                data_types.push(ty);
            }
        }

        // Data members after an unresolved type cannot be placed.
        let resolved: Vec<_> = data_types.iter().map_while(Clone::clone).collect();
        let mut decoded = abi::decode_tuple(&resolved, 0, &self.data, limits);
        decoded.resize(data_types.len(), None);

        self.name = event.name().map(str::to_string);
        self.arguments = params
            .iter()
            .enumerate()
            .zip(slots)
            .map(|((i, param), slot)| {
                let value = match slot {
                    ArgumentSource::Topic(value) => value,
                    ArgumentSource::Data(index) => decoded[index].clone(),
                };
                (param_name(param, i), value)
            })
            .collect();
    }
}

enum ArgumentSource {
    Topic(Option<Value>),
    /// Index into the members encoded in the log data.
    Data(usize),
}

/// Topics of a `LOGn` from its stack, which holds `offset, size, topic0, ..` from the top.
pub fn read_log_topics(stack: &[U256], count: usize) -> Option<Vec<B256>> {
    (0..count).map(|i| peek(stack, 2 + i).map(B256::from)).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::artifact::ast::AstArena;
    use serde_json::json;

    fn node(json: serde_json::Value) -> NodeRef {
        let mut arena = AstArena::new();
        let root = arena.insert_tree(&json).unwrap();
        NodeRef::new(Arc::new(arena), root).unwrap()
    }

    fn param(id: usize, name: &str, type_name: &str, location: &str) -> serde_json::Value {
        json!({
            "nodeType": "VariableDeclaration", "id": id, "src": "0:0:0", "name": name,
            "storageLocation": location,
            "typeName": { "nodeType": "ElementaryTypeName", "id": id + 1000, "src": "0:0:0", "name": type_name }
        })
    }

    #[test]
    fn test_internal_argument_offsets() {
        // function f(uint256 a, bytes calldata b, bool c) internal returns (uint256, bool)
        let f = node(json!({
            "nodeType": "FunctionDefinition", "id": 1, "src": "0:0:0", "name": "f", "kind": "function",
            "parameters": { "nodeType": "ParameterList", "id": 2, "src": "0:0:0", "parameters": [
                param(3, "a", "uint256", "default"),
                param(4, "b", "bytes", "calldata"),
                param(5, "c", "bool", "default"),
            ]},
            "returnParameters": { "nodeType": "ParameterList", "id": 6, "src": "0:0:0", "parameters": [
                param(7, "", "uint256", "default"),
                param(8, "ok", "bool", "default"),
            ]}
        }));
        let converter = TypeConverter::new(8);

        let offsets: Vec<_> = internal_arguments(&f, &converter)
            .into_iter()
            .map(|view| (view.name, view.location))
            .collect();
        assert_eq!(
            offsets,
            vec![
                ("a".to_string(), Location::Stack { offset_from_top: 3 }),
                ("b".to_string(), Location::Stack { offset_from_top: 2 }),
                ("c".to_string(), Location::Stack { offset_from_top: 0 }),
            ]
        );

        let returns: Vec<_> = internal_returns(&f, &converter)
            .into_iter()
            .map(|view| (view.name, view.location))
            .collect();
        assert_eq!(
            returns,
            vec![
                ("_0".to_string(), Location::Stack { offset_from_top: 2 }),
                ("ok".to_string(), Location::Stack { offset_from_top: 1 }),
            ]
        );

        let returns = external_returns(&f, &converter);
        assert_eq!(returns[1].location, Location::CallData { address: 32 });
    }

    #[test]
    fn test_read_log_topics_order() {
        let stack =
            [U256::from(3), U256::from(2), U256::from(1), U256::from(0x20), U256::from(0x80)];
        assert_eq!(
            read_log_topics(&stack, 3),
            Some(vec![B256::from(U256::from(1)), B256::from(U256::from(2)), B256::from(U256::from(3))])
        );
        assert_eq!(read_log_topics(&stack, 4), None);
    }
}
