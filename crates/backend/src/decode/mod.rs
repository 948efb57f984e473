//! Decoding of language-level values out of the EVM's data spaces.
//!
//! All decoders are total: any out-of-bounds read, oversized length or unrepresentable type
//! yields `None` ("undefined") for the affected subtree instead of an error.

pub mod abi;
pub mod memory;
pub mod stack;
pub mod state;
pub mod storage;
pub mod value;
pub mod word;

use alloy_primitives::U256;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub use self::value::Value;
use crate::{artifact::types::TypeDesc, config::DebuggerConfig, trace::preimage::MapKeyIndex};

/// Storage of one account: slot to value. Missing slots read as zero.
pub type StorageDump = FxHashMap<U256, U256>;

/// A position in storage.
///
/// `end` counts the bytes of the word at `slot` still free for packing. Values are packed
/// from the low-order end of the word, so the next value occupies `[end - size, end)` of the
/// big-endian word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageCursor {
    pub slot: U256,
    pub end: usize,
}

impl StorageCursor {
    /// The beginning of `slot`.
    pub const fn new(slot: U256) -> Self {
        Self { slot, end: 32 }
    }

    /// The beginning of the following slot.
    pub fn next_slot(self) -> Self {
        Self::new(self.slot.wrapping_add(U256::from(1)))
    }

    /// Start of a value that must begin on a fresh slot.
    pub fn aligned(self) -> Self {
        if self.end == 32 {
            self
        } else {
            self.next_slot()
        }
    }
}

/// Where a value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// Word index counted from the top of the stack.
    Stack { offset_from_top: usize },
    Memory { address: usize },
    /// Byte address in ABI-encoded data: call data, return data or a log payload.
    CallData { address: usize },
    Storage(StorageCursor),
}

/// Ceilings bounding what a decoder is willing to allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_array_length: usize,
    pub max_bytes_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        (&DebuggerConfig::default()).into()
    }
}

impl From<&DebuggerConfig> for Limits {
    fn from(config: &DebuggerConfig) -> Self {
        Self {
            max_array_length: config.max_array_length,
            max_bytes_length: config.max_bytes_length,
        }
    }
}

/// Inputs of the storage decoder.
#[derive(Clone, Copy, Debug)]
pub struct StorageContext<'a> {
    pub storage: &'a StorageDump,
    /// Observed mapping keys. Mappings cannot be enumerated without it.
    pub map_keys: Option<&'a MapKeyIndex>,
    pub limits: Limits,
}

impl StorageContext<'_> {
    /// Value of `slot`, zero when never written.
    pub fn slot(&self, slot: U256) -> U256 {
        self.storage.get(&slot).copied().unwrap_or_default()
    }
}

/// Machine state a [`DataView`] is decoded against.
#[derive(Clone, Copy, Debug)]
pub struct DecodeContext<'a> {
    /// Operand stack, top at the end.
    pub stack: &'a [U256],
    pub memory: &'a [u8],
    /// ABI-encoded data addressed by [`Location::CallData`].
    pub calldata: &'a [u8],
    pub storage: &'a StorageDump,
    pub map_keys: Option<&'a MapKeyIndex>,
    pub limits: Limits,
}

impl<'a> DecodeContext<'a> {
    pub fn storage_context(&self) -> StorageContext<'a> {
        StorageContext { storage: self.storage, map_keys: self.map_keys, limits: self.limits }
    }

    /// The same state, with `data` as the ABI-encoded space.
    pub fn with_calldata(&self, data: &'a [u8]) -> Self {
        Self { calldata: data, ..*self }
    }
}

/// A named, typed value at a known location, decoded lazily.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataView {
    pub name: String,
    /// `None` when the declared type could not be resolved.
    pub ty: Option<TypeDesc>,
    pub location: Location,
    /// Start of the enclosing ABI tuple; dynamic offsets in call data are relative to it.
    pub abi_base: usize,
}

impl DataView {
    pub fn new(name: impl Into<String>, ty: Option<TypeDesc>, location: Location) -> Self {
        Self { name: name.into(), ty, location, abi_base: 0 }
    }

    /// Views over the members of an ABI-encoded tuple starting at `base`.
    ///
    /// Stops at the first member whose head size is unknown, since every later member's
    /// position depends on it.
    pub fn abi_tuple(
        params: impl IntoIterator<Item = (String, Option<TypeDesc>)>,
        base: usize,
    ) -> Vec<Self> {
        let mut views = vec![];
        let mut head = base;
        for (name, ty) in params {
            let Some(size) = ty.as_ref().and_then(TypeDesc::abi_head_size) else {
                trace!(name, "cannot place parameters after an unresolved type");
                break;
            };
            views.push(Self {
                name,
                ty,
                location: Location::CallData { address: head },
                abi_base: base,
            });
            let Some(next) = head.checked_add(size) else { break };
            head = next;
        }
        views
    }

    /// Decodes the viewed value, `None` when undefined.
    pub fn decode(&self, ctx: &DecodeContext<'_>) -> Option<Value> {
        let ty = self.ty.as_ref()?;
        match self.location {
            Location::Stack { offset_from_top } => {
                stack::decode(ty, offset_from_top, ctx).map(|(value, _)| value)
            }
            Location::Memory { address } => {
                memory::decode(ty, address, ctx.memory, &ctx.limits).map(|(value, _)| value)
            }
            Location::CallData { address } => {
                abi::decode(ty, address, self.abi_base, ctx.calldata, &ctx.limits)
                    .map(|(value, _)| value)
            }
            Location::Storage(cursor) => {
                storage::decode(ty, cursor, &ctx.storage_context()).map(|(value, _)| value)
            }
        }
    }
}

/// Strategies shared by the decoder tests.
#[cfg(test)]
pub(crate) mod testing {
    use alloy_primitives::{I256, U256};
    use proptest::prelude::*;

    /// A width in `8..=256` and a value of the `intN` of that width.
    pub(crate) fn signed_int() -> impl Strategy<Value = (u16, I256)> {
        ((1u16..=32).prop_map(|b| b * 8), any::<[u8; 32]>()).prop_map(|(bits, raw)| {
            let shift = 256 - bits as usize;
            (bits, I256::from_raw(U256::from_be_bytes(raw) << shift).asr(shift))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    #[test]
    fn test_abi_tuple_placement() {
        let params = vec![
            ("to".to_string(), Some(TypeDesc::Address)),
            ("data".to_string(), Some(TypeDesc::Bytes)),
            ("pair".to_string(), Some(TypeDesc::Array { elem: Box::new(TypeDesc::Bool), size: Some(2) })),
            ("lost".to_string(), None),
            ("after".to_string(), Some(TypeDesc::Bool)),
        ];
        let views = DataView::abi_tuple(params, 4);
        let addresses: Vec<_> = views.iter().map(|view| view.location).collect();
        assert_eq!(
            addresses,
            vec![
                Location::CallData { address: 4 },
                Location::CallData { address: 36 },
                Location::CallData { address: 68 },
            ]
        );
        assert!(views.iter().all(|view| view.abi_base == 4));
    }

    #[test]
    fn test_view_decodes_against_context() {
        let to = Address::repeat_byte(0x11);
        let mut calldata = vec![0xde, 0xad, 0xbe, 0xef];
        calldata.extend_from_slice(to.into_word().as_slice());

        let storage = StorageDump::default();
        let ctx = DecodeContext {
            stack: &[U256::from(7)],
            memory: &[],
            calldata: &calldata,
            storage: &storage,
            map_keys: None,
            limits: Limits::default(),
        };

        let views = DataView::abi_tuple([("to".to_string(), Some(TypeDesc::Address))], 4);
        assert_eq!(views[0].decode(&ctx), Some(Value::Address(to)));

        let on_stack =
            DataView::new("x", Some(TypeDesc::Uint(8)), Location::Stack { offset_from_top: 0 });
        assert_eq!(on_stack.decode(&ctx), Some(Value::Uint(U256::from(7), 8)));

        let unknown = DataView::new("y", None, Location::Stack { offset_from_top: 0 });
        assert_eq!(unknown.decode(&ctx), None);
    }
}
