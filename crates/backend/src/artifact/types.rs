//! Type descriptors derived from `typeName` AST nodes, and the signature/selector oracle.

use std::fmt;

use alloy_primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};

use super::ast::NodeRef;

/// Where a reference type lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataLocation {
    Memory,
    CallData,
    Storage,
}

impl DataLocation {
    /// Parses the AST `storageLocation` attribute. `default` yields `None`.
    pub fn from_ast(location: &str) -> Option<Self> {
        match location {
            "memory" => Some(Self::Memory),
            "calldata" => Some(Self::CallData),
            "storage" => Some(Self::Storage),
            _ => None,
        }
    }
}

/// A language-level type.
///
/// Reference types appear bare when they are stored inline in their container (storage,
/// ABI-encoded data) and wrapped in [`TypeDesc::Pointer`] when a word holds their address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDesc {
    Bool,
    Uint(u16),
    Int(u16),
    Address,
    FixedBytes(u8),
    Enum { name: String, members: Vec<String> },
    Function { external: bool },
    Bytes,
    String,
    Array { elem: Box<TypeDesc>, size: Option<usize> },
    Struct { name: String, fields: Vec<(String, TypeDesc)> },
    Mapping { key: Box<TypeDesc>, value: Box<TypeDesc> },
    Pointer { to: Box<TypeDesc>, location: DataLocation },
}

impl TypeDesc {
    /// Types that fit in a single word and are copied by value.
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            Self::Bool |
                Self::Uint(_) |
                Self::Int(_) |
                Self::Address |
                Self::FixedBytes(_) |
                Self::Enum { .. } |
                Self::Function { .. }
        )
    }

    /// Bit width of the unsigned integer an enum is encoded as.
    pub fn enum_bits(members: usize) -> u16 {
        let mut bits = 8u16;
        while bits < 64 && (members as u128) > (1u128 << bits) {
            bits += 8;
        }
        bits
    }

    /// Bytes occupied by a value type when packed into storage.
    pub fn packed_size(&self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Uint(bits) | Self::Int(bits) => Some(*bits as usize / 8),
            Self::Address => Some(20),
            Self::FixedBytes(n) => Some(*n as usize),
            Self::Enum { members, .. } => Some(Self::enum_bits(members.len()) as usize / 8),
            Self::Function { external: true } => Some(24),
            Self::Function { external: false } => Some(8),
            Self::Pointer { .. } => Some(32),
            _ => None,
        }
    }

    /// Whether the ABI encoding of this type has a dynamic size.
    pub fn is_abi_dynamic(&self) -> bool {
        match self {
            Self::Bytes | Self::String | Self::Array { size: None, .. } => true,
            Self::Array { elem, size: Some(_) } => elem.is_abi_dynamic(),
            Self::Struct { fields, .. } => fields.iter().any(|(_, ty)| ty.is_abi_dynamic()),
            Self::Pointer { to, .. } => to.is_abi_dynamic(),
            _ => false,
        }
    }

    /// Bytes this type occupies in the head of an ABI-encoded tuple.
    pub fn abi_head_size(&self) -> Option<usize> {
        if self.is_abi_dynamic() {
            return Some(32);
        }
        match self {
            Self::Array { elem, size: Some(n) } => elem.abi_head_size()?.checked_mul(*n),
            Self::Struct { fields, .. } => {
                fields.iter().try_fold(0usize, |acc, (_, ty)| acc.checked_add(ty.abi_head_size()?))
            }
            Self::Pointer { to, .. } => to.abi_head_size(),
            Self::Mapping { .. } => None,
            _ => Some(32),
        }
    }

    /// Canonical ABI type name used in signatures.
    pub fn abi_name(&self) -> Option<String> {
        Some(match self {
            Self::Bool => "bool".to_string(),
            Self::Uint(bits) => format!("uint{bits}"),
            Self::Int(bits) => format!("int{bits}"),
            Self::Address => "address".to_string(),
            Self::FixedBytes(n) => format!("bytes{n}"),
            Self::Enum { members, .. } => format!("uint{}", Self::enum_bits(members.len())),
            Self::Function { external: true } => "function".to_string(),
            Self::Function { external: false } => return None,
            Self::Bytes => "bytes".to_string(),
            Self::String => "string".to_string(),
            Self::Array { elem, size } => match size {
                Some(n) => format!("{}[{n}]", elem.abi_name()?),
                None => format!("{}[]", elem.abi_name()?),
            },
            Self::Struct { fields, .. } => {
                let fields =
                    fields.iter().map(|(_, ty)| ty.abi_name()).collect::<Option<Vec<_>>>()?;
                format!("({})", fields.join(","))
            }
            Self::Mapping { .. } => return None,
            Self::Pointer { to, .. } => return to.abi_name(),
        })
    }

    /// Strips pointer wrappers, including nested ones.
    pub fn bare(&self) -> Self {
        match self {
            Self::Pointer { to, .. } => to.bare(),
            Self::Array { elem, size } => Self::Array { elem: Box::new(elem.bare()), size: *size },
            Self::Struct { name, fields } => Self::Struct {
                name: name.clone(),
                fields: fields.iter().map(|(n, ty)| (n.clone(), ty.bare())).collect(),
            },
            other => other.clone(),
        }
    }

    fn is_reference(&self) -> bool {
        matches!(
            self,
            Self::Bytes | Self::String | Self::Array { .. } | Self::Struct { .. } | Self::Mapping { .. }
        )
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enum { name, .. } => write!(f, "enum {name}"),
            Self::Function { external } => {
                write!(f, "function {}", if *external { "external" } else { "internal" })
            }
            Self::Array { elem, size: Some(n) } => write!(f, "{elem}[{n}]"),
            Self::Array { elem, size: None } => write!(f, "{elem}[]"),
            Self::Struct { name, .. } => write!(f, "struct {name}"),
            Self::Mapping { key, value } => write!(f, "mapping({key} => {value})"),
            Self::Pointer { to, location } => {
                let location = match location {
                    DataLocation::Memory => "memory",
                    DataLocation::CallData => "calldata",
                    DataLocation::Storage => "storage",
                };
                write!(f, "{to} {location}")
            }
            other => match other.abi_name() {
                Some(name) => f.write_str(&name),
                None => f.write_str("?"),
            },
        }
    }
}

/// Converts AST type names into [`TypeDesc`]s.
#[derive(Clone, Copy, Debug)]
pub struct TypeConverter {
    max_depth: usize,
}

impl TypeConverter {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Type of a parameter, return value or local variable: a word on the stack.
    ///
    /// Reference types become pointers into `storageLocation`, or into `default` when the
    /// declaration does not name one.
    pub fn stack_variable(&self, decl: &NodeRef, default: DataLocation) -> Option<TypeDesc> {
        let location =
            decl.attr_str("storageLocation").and_then(DataLocation::from_ast).unwrap_or(default);
        let type_name = decl.child("typeName")?;
        self.convert(&type_name, location, true, 0)
    }

    /// Type of a state variable, stored inline in storage.
    pub fn state_variable(&self, decl: &NodeRef) -> Option<TypeDesc> {
        let type_name = decl.child("typeName")?;
        self.convert(&type_name, DataLocation::Storage, false, 0)
    }

    /// Type of a parameter as it is ABI-encoded (call data, return data, event data).
    pub fn abi_parameter(&self, decl: &NodeRef) -> Option<TypeDesc> {
        let type_name = decl.child("typeName")?;
        self.convert(&type_name, DataLocation::CallData, false, 0)
    }

    /// Converts a `typeName` node placed in `location`.
    ///
    /// `pointer` wraps a top-level reference type into a pointer; memory containers always
    /// hold pointers to their reference-typed elements.
    pub fn convert(
        &self,
        type_name: &NodeRef,
        location: DataLocation,
        pointer: bool,
        depth: usize,
    ) -> Option<TypeDesc> {
        if depth > self.max_depth {
            trace!(depth, "type nesting exceeds the configured limit");
            return None;
        }

        let ty = match type_name.node_type() {
            "ElementaryTypeName" => elementary(type_name.name()?)?,
            "ArrayTypeName" => {
                let base = type_name.child("baseType")?;
                let elem = self.convert(&base, location, false, depth + 1)?;
                TypeDesc::Array { elem: Box::new(elem), size: array_length(type_name) }
            }
            "Mapping" => {
                let key = self.convert(
                    &type_name.child("keyType")?,
                    DataLocation::Storage,
                    false,
                    depth + 1,
                )?;
                let value = self.convert(
                    &type_name.child("valueType")?,
                    DataLocation::Storage,
                    false,
                    depth + 1,
                )?;
                TypeDesc::Mapping { key: Box::new(key), value: Box::new(value) }
            }
            "UserDefinedTypeName" => {
                let decl = type_name.referenced_declaration()?;
                self.user_defined(&decl, location, depth)?
            }
            "FunctionTypeName" => {
                TypeDesc::Function { external: type_name.visibility() == Some("external") }
            }
            _ => return None,
        };

        let mapping = matches!(ty, TypeDesc::Mapping { .. });
        if ty.is_reference() && (pointer || (location == DataLocation::Memory && !mapping)) {
            let location = if mapping { DataLocation::Storage } else { location };
            Some(TypeDesc::Pointer { to: Box::new(ty), location })
        } else {
            Some(ty)
        }
    }

    fn user_defined(
        &self,
        decl: &NodeRef,
        location: DataLocation,
        depth: usize,
    ) -> Option<TypeDesc> {
        match decl.node_type() {
            "StructDefinition" => {
                let fields = decl
                    .members()
                    .iter()
                    .map(|member| {
                        let type_name = member.child("typeName")?;
                        let ty = self.convert(&type_name, location, false, depth + 1)?;
                        Some((member.name().unwrap_or_default().to_string(), ty))
                    })
                    .collect::<Option<Vec<_>>>()?;
                let name = decl
                    .attr_str("canonicalName")
                    .or_else(|| decl.name())
                    .unwrap_or_default()
                    .to_string();
                Some(TypeDesc::Struct { name, fields })
            }
            "EnumDefinition" => {
                let members = decl
                    .members()
                    .iter()
                    .map(|m| m.name().unwrap_or_default().to_string())
                    .collect();
                let name = decl
                    .attr_str("canonicalName")
                    .or_else(|| decl.name())
                    .unwrap_or_default()
                    .to_string();
                Some(TypeDesc::Enum { name, members })
            }
            "ContractDefinition" => Some(TypeDesc::Address),
            "UserDefinedValueTypeDefinition" => {
                self.convert(&decl.child("underlyingType")?, location, false, depth + 1)
            }
            _ => None,
        }
    }
}

/// Parses an elementary type name.
pub fn elementary(name: &str) -> Option<TypeDesc> {
    let name = name.strip_suffix(" payable").unwrap_or(name);
    Some(match name {
        "bool" => TypeDesc::Bool,
        "address" => TypeDesc::Address,
        "string" => TypeDesc::String,
        "bytes" => TypeDesc::Bytes,
        "byte" => TypeDesc::FixedBytes(1),
        "uint" => TypeDesc::Uint(256),
        "int" => TypeDesc::Int(256),
        _ => {
            if let Some(bits) = name.strip_prefix("uint") {
                TypeDesc::Uint(int_bits(bits)?)
            } else if let Some(bits) = name.strip_prefix("int") {
                TypeDesc::Int(int_bits(bits)?)
            } else if let Some(n) = name.strip_prefix("bytes") {
                let n: u8 = n.parse().ok()?;
                if !(1..=32).contains(&n) {
                    return None;
                }
                TypeDesc::FixedBytes(n)
            } else {
                return None;
            }
        }
    })
}

fn int_bits(bits: &str) -> Option<u16> {
    let bits: u16 = bits.parse().ok()?;
    (bits % 8 == 0 && (8..=256).contains(&bits)).then_some(bits)
}

/// Length of a fixed-size array type name, `None` for dynamic arrays.
fn array_length(type_name: &NodeRef) -> Option<usize> {
    let length = type_name.child("length")?;
    if let Some(value) = length.attr_str("value") {
        if let Some(n) = parse_number(value) {
            return Some(n);
        }
    }

    // Constant expressions: fall back to the resolved type string, e.g. `uint256[4] storage ref`.
    let type_string = type_name.attr("typeDescriptions")?.get("typeString")?.as_str()?;
    let ty = type_string.split(' ').find(|part| part.ends_with(']'))?;
    let open = ty.rfind('[')?;
    ty[open + 1..ty.len() - 1].parse().ok()
}

fn parse_number(value: &str) -> Option<usize> {
    let value = value.replace('_', "");
    match value.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Canonical signature of a function, event or public getter, e.g. `transfer(address,uint256)`.
pub fn signature(node: &NodeRef, converter: &TypeConverter) -> Option<String> {
    let name = node.name()?;
    let params = if node.is_public_state_variable() {
        getter_parameters(node, converter)?
            .iter()
            .map(TypeDesc::abi_name)
            .collect::<Option<Vec<_>>>()?
    } else {
        node.parameters()
            .iter()
            .map(|param| converter.abi_parameter(param)?.abi_name())
            .collect::<Option<Vec<_>>>()?
    };
    Some(format!("{name}({})", params.join(",")))
}

/// 4-byte selector of a function or public getter.
pub fn selector(node: &NodeRef, converter: &TypeConverter) -> Option<[u8; 4]> {
    if let Some(selector) = node.function_selector() {
        return Some(selector);
    }
    let signature = signature(node, converter)?;
    let hash = keccak256(signature.as_bytes());
    Some([hash[0], hash[1], hash[2], hash[3]])
}

/// Topic 0 of a non-anonymous event.
pub fn event_selector(node: &NodeRef, converter: &TypeConverter) -> Option<B256> {
    if node.attr_bool("anonymous") == Some(true) {
        return None;
    }
    if let Some(selector) = node.attr_str("eventSelector") {
        let bytes = hex::decode(selector).ok()?;
        return (bytes.len() == 32).then(|| B256::from_slice(&bytes));
    }
    Some(keccak256(signature(node, converter)?.as_bytes()))
}

/// Parameters of the getter generated for a public state variable: mapping keys and array
/// indices, outermost first.
pub fn getter_parameters(decl: &NodeRef, converter: &TypeConverter) -> Option<Vec<TypeDesc>> {
    let mut params = vec![];
    let mut current = decl.child("typeName")?;
    loop {
        match current.node_type() {
            "Mapping" => {
                let key = current.child("keyType")?;
                params.push(converter.convert(&key, DataLocation::CallData, false, 0)?);
                current = current.child("valueType")?;
            }
            "ArrayTypeName" => {
                params.push(TypeDesc::Uint(256));
                current = current.child("baseType")?;
            }
            _ => break,
        }
    }
    Some(params)
}
