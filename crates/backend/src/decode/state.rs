//! Snapshot of every persistent state variable of a deployed contract.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use super::{storage, value::Value, StorageContext, StorageCursor};
use crate::artifact::{
    ast::NodeRef,
    contract::ContractRecord,
    types::{elementary, TypeConverter, TypeDesc},
};

/// One decoded state variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVariable {
    /// Declaring contract.
    pub contract: String,
    pub name: String,
    pub ty: Option<TypeDesc>,
    /// `None` once the layout can no longer be followed.
    pub location: Option<StorageCursor>,
    pub value: Option<Value>,
}

/// Decodes the state variables of `record`, most base contract first, in layout order.
///
/// Constants and immutables take no storage and are skipped. A variable that fails to decode
/// is undefined while the cursor still advances past it. A variable whose type cannot be
/// resolved falls back to its type string; when that has no known size either, it and every
/// later variable are undefined.
pub fn decode_contract_state(
    record: &ContractRecord,
    converter: &TypeConverter,
    ctx: &StorageContext<'_>,
) -> Vec<StateVariable> {
    let mut cursor = Some(StorageCursor::new(U256::ZERO));
    let mut variables = vec![];

    for decl in record.state_variables() {
        if decl.is_storage_less() {
            continue;
        }

        let contract = decl
            .ancestor("ContractDefinition")
            .and_then(|c| c.name().map(str::to_string))
            .unwrap_or_default();
        let name = decl.name().unwrap_or_default().to_string();
        let ty = converter.state_variable(&decl).or_else(|| {
            let ty = type_string_layout(&decl)?;
            debug!(contract, name, %ty, "laid out unresolved state variable by its type string");
            Some(ty)
        });

        let (location, value) = match (&ty, cursor) {
            (Some(ty), Some(at)) => {
                let placed = storage::place(ty, at);
                cursor = placed.map(|(_, next)| next);
                let value = storage::decode(ty, at, ctx).map(|(value, _)| value);
                (placed.map(|(position, _)| position), value)
            }
            (None, Some(_)) => {
                debug!(contract, name, "unresolved state variable type, layout lost");
                cursor = None;
                (None, None)
            }
            (_, None) => (None, None),
        };

        if value.is_none() {
            trace!(contract, name, "state variable is undefined");
        }
        variables.push(StateVariable { contract, name, ty, location, value });
    }

    variables
}

/// Type with the storage footprint named by the declaration's type string.
///
/// Contract references and enums take a fixed number of bytes whatever their definition.
fn type_string_layout(decl: &NodeRef) -> Option<TypeDesc> {
    let read = |node: &NodeRef| {
        node.attr("typeDescriptions")?.get("typeString")?.as_str().map(str::to_string)
    };
    let type_string =
        decl.child("typeName").and_then(|type_name| read(&type_name)).or_else(|| read(decl))?;

    if let Some(name) = type_string.strip_prefix("enum ") {
        return Some(TypeDesc::Enum { name: name.to_string(), members: vec![] });
    }
    if type_string.starts_with("contract ") {
        return Some(TypeDesc::Address);
    }
    elementary(&type_string)
}
