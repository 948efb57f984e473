use std::fmt;

use alloy_primitives::{Address, Bytes, FixedBytes, B256, I256, U256};
use serde::{Deserialize, Serialize};

/// A decoded language-level value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    /// Unsigned integer and its bit width. Enums and internal function pointers decode to this.
    Uint(U256, u16),
    Int(I256, u16),
    Address(Address),
    /// Left-aligned bytes and their count.
    FixedBytes(B256, u8),
    /// An external function pointer.
    Function { address: Address, selector: FixedBytes<4> },
    Bytes(Bytes),
    /// Invalid UTF-8 is replaced, never rejected.
    String(String),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
    /// Only the keys observed during execution.
    Mapping(Vec<(Value, Value)>),
}

impl Value {
    pub fn as_uint(&self) -> Option<U256> {
        match self {
            Self::Uint(v, _) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Field of a struct value by name.
    pub fn field(&self, name: &str) -> Option<&Self> {
        match self {
            Self::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Value stored under `key` in a mapping value.
    pub fn get(&self, key: &Self) -> Option<&Self> {
        match self {
            Self::Mapping(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Uint(v, _) => write!(f, "{v}"),
            Self::Int(v, _) => write!(f, "{v}"),
            Self::Address(a) => write!(f, "{a}"),
            Self::FixedBytes(b, n) => write!(f, "0x{}", hex::encode(&b[..*n as usize])),
            Self::Function { address, selector } => write!(f, "{address}.{selector}"),
            Self::Bytes(b) => write!(f, "{b}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Struct(fields) => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Mapping(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key} => {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let value = Value::Struct(vec![
            ("n".to_string(), Value::Int(I256::try_from(-3i64).unwrap(), 8)),
            ("tag".to_string(), Value::FixedBytes(B256::ZERO, 0)),
            (
                "xs".to_string(),
                Value::Array(vec![Value::Bool(true), Value::String("hi".to_string())]),
            ),
        ]);
        assert_eq!(value.to_string(), r#"{n: -3, tag: 0x, xs: [true, "hi"]}"#);
        assert_eq!(value.field("n"), Some(&Value::Int(I256::try_from(-3i64).unwrap(), 8)));
        assert_eq!(value.field("n").and_then(Value::as_uint), None);
        assert_eq!(Value::Uint(U256::from(9), 8).as_uint(), Some(U256::from(9)));
    }
}
