//! Bounded reads over raw byte spaces.
//!
//! Every read returns `None` instead of panicking when the requested range is not fully
//! inside the buffer.

use alloy_primitives::{B256, U256};

/// Converts a word into a `usize`, if it fits.
#[inline]
pub fn to_usize(value: U256) -> Option<usize> {
    (value <= U256::from(usize::MAX)).then(|| value.to::<usize>())
}

/// Returns `data[offset..offset + len]`.
#[inline]
pub fn read_slice(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    data.get(offset..offset.checked_add(len)?)
}

/// Returns the 32-byte word at `offset`.
#[inline]
pub fn read_word(data: &[u8], offset: usize) -> Option<B256> {
    read_slice(data, offset, 32).map(B256::from_slice)
}

/// Returns the 32-byte word at `offset` as an unsigned integer.
#[inline]
pub fn read_u256(data: &[u8], offset: usize) -> Option<U256> {
    read_word(data, offset).map(|w| U256::from_be_bytes(w.0))
}

/// Reads a word holding an offset or a length and converts it to `usize`.
#[inline]
pub fn read_usize(data: &[u8], offset: usize) -> Option<usize> {
    read_u256(data, offset).and_then(to_usize)
}

/// Copies `data[offset..offset + len]`, zero-filling whatever lies past the end of `data`.
///
/// This mirrors how the EVM reads memory that has not been touched yet. Lengths above
/// `max_len` yield `None` before anything is allocated.
pub fn read_slice_padded(data: &[u8], offset: U256, len: U256, max_len: usize) -> Option<Vec<u8>> {
    let len = to_usize(len).filter(|len| *len <= max_len)?;
    if len == 0 {
        return Some(Vec::new());
    }
    let offset = to_usize(offset)?;
    let mut out = vec![0u8; len];
    if offset < data.len() {
        let end = data.len().min(offset.checked_add(len)?);
        out[..end - offset].copy_from_slice(&data[offset..end]);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_reads() {
        let data = [1u8; 40];
        assert!(read_word(&data, 8).is_some());
        assert!(read_word(&data, 9).is_none());
        assert!(read_slice(&data, usize::MAX, 2).is_none());
        assert_eq!(to_usize(U256::MAX), None);
        assert_eq!(to_usize(U256::from(7)), Some(7));
    }

    #[test]
    fn test_padded_read() {
        let data = [0xaa, 0xbb];
        assert_eq!(
            read_slice_padded(&data, U256::from(1), U256::from(3), 64).unwrap(),
            vec![0xbb, 0, 0]
        );
        assert_eq!(read_slice_padded(&data, U256::MAX, U256::ZERO, 64).unwrap(), Vec::<u8>::new());
        assert!(read_slice_padded(&data, U256::MAX, U256::from(1), 64).is_none());
    }

    #[test]
    fn test_padded_read_rejects_huge_lengths() {
        let data = [0xaa, 0xbb];
        assert!(read_slice_padded(&data, U256::ZERO, U256::from(1u64 << 63), 1 << 20).is_none());
        assert!(read_slice_padded(&data, U256::ZERO, U256::from(65), 64).is_none());
        assert_eq!(read_slice_padded(&data, U256::ZERO, U256::from(64), 64).map(|v| v.len()), Some(64));
    }
}
