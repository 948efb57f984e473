//! Keccak preimages observed during replay, and the mapping keys derived from them.

use alloy_primitives::{Bytes, U256};
use rustc_hash::FxHashMap;

/// Hash output to the exact bytes that were hashed. Grows monotonically during replay.
#[derive(Clone, Debug, Default)]
pub struct PreimageIndex {
    inner: FxHashMap<U256, Bytes>,
}

impl PreimageIndex {
    /// Records that `keccak256(input) == output`.
    pub fn record(&mut self, input: Bytes, output: U256) {
        self.inner.entry(output).or_insert(input);
    }

    pub fn get(&self, hash: &U256) -> Option<&Bytes> {
        self.inner.get(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&U256, &Bytes)> {
        self.inner.iter()
    }
}

/// Mapping base slot to the keys observed for it.
///
/// A mapping at slot `p` stores the value for key `k` at `keccak256(k ++ p)`, so every
/// preimage of at least 32 bytes is a candidate: its last word is the slot, the rest the key.
#[derive(Clone, Debug, Default)]
pub struct MapKeyIndex {
    inner: FxHashMap<U256, Vec<(Bytes, U256)>>,
}

impl MapKeyIndex {
    pub fn build(preimages: &PreimageIndex) -> Self {
        let mut inner: FxHashMap<U256, Vec<(Bytes, U256)>> = FxHashMap::default();
        for (hash, input) in preimages.iter() {
            let Some(split) = input.len().checked_sub(32) else { continue };
            let slot = U256::from_be_slice(&input[split..]);
            inner.entry(slot).or_default().push((Bytes::copy_from_slice(&input[..split]), *hash));
        }
        // Hash map iteration order is arbitrary; keep entries stable.
        for keys in inner.values_mut() {
            keys.sort();
        }
        trace!(slots = inner.len(), preimages = preimages.len(), "built mapping key index");
        Self { inner }
    }

    /// `(key bytes, value slot)` pairs observed for the mapping rooted at `slot`.
    pub fn keys(&self, slot: U256) -> &[(Bytes, U256)] {
        self.inner.get(&slot).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of candidate base slots.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
