use revm::interpreter::opcode::{
    CALL, CALLCODE, CALLDATACOPY, CODECOPY, CREATE, CREATE2, DELEGATECALL, EXTCODECOPY, LOG0,
    LOG4, MCOPY, MLOAD, MSTORE, MSTORE8, PUSH0, PUSH1, PUSH32, RETURNDATACOPY, SSTORE,
    STATICCALL,
};
use rustc_hash::FxHashMap;

/// Returns true if the opcode may modify memory.
/// <https://bluealloy.github.io/revm/crates/interpreter/memory.html#opcodes>
/// <https://github.com/crytic/evm-opcodes>
///
/// `MLOAD` is listed because it can expand memory.
#[inline]
pub const fn is_memory_modifying_opcode(op: u8) -> bool {
    matches!(
        op,
        EXTCODECOPY |
            MLOAD |
            MSTORE |
            MSTORE8 |
            MCOPY |
            CODECOPY |
            CALLDATACOPY |
            RETURNDATACOPY |
            CALL |
            CALLCODE |
            DELEGATECALL |
            STATICCALL
    )
}

/// Returns true if the opcode may modify the storage of the executing account.
#[inline]
pub const fn is_storage_modifying_opcode(op: u8) -> bool {
    matches!(op, SSTORE | CALL | CALLCODE | DELEGATECALL | STATICCALL | CREATE | CREATE2)
}

/// Opcodes that enter a new message call frame.
#[inline]
pub const fn is_call_opcode(op: u8) -> bool {
    matches!(op, CALL | CALLCODE | DELEGATECALL | STATICCALL)
}

/// Opcodes that enter a new contract creation frame.
#[inline]
pub const fn is_create_opcode(op: u8) -> bool {
    matches!(op, CREATE | CREATE2)
}

/// Opcodes after which the call depth may grow by one.
#[inline]
pub const fn is_depth_increasing_opcode(op: u8) -> bool {
    is_call_opcode(op) || is_create_opcode(op)
}

/// Returns the number of topics of a `LOGn` opcode.
#[inline]
pub const fn log_topics(op: u8) -> Option<usize> {
    if op >= LOG0 && op <= LOG4 {
        Some((op - LOG0) as usize)
    } else {
        None
    }
}

/// Maps from program counter to instruction counter.
///
/// Push immediates are skipped, so only pcs that start an instruction are present.
#[derive(Debug, Clone, Default)]
pub struct PcIcMap {
    pub inner: FxHashMap<usize, usize>,
}

impl PcIcMap {
    /// Creates a new `PcIcMap` for the given code.
    pub fn new(code: &[u8]) -> Self {
        let mut inner = FxHashMap::default();

        let mut pc = 0;
        let mut cumulative_push_size = 0;
        while pc < code.len() {
            inner.insert(pc, pc - cumulative_push_size);

            if (PUSH1..=PUSH32).contains(&code[pc]) {
                // Skip the push bytes.
                let push_size = (code[pc] - PUSH0) as usize;
                pc += push_size;
                cumulative_push_size += push_size;
            }

            pc += 1;
        }

        Self { inner }
    }

    /// Returns the length of the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the instruction counter for the given program counter.
    pub fn get(&self, pc: usize) -> Option<usize> {
        self.inner.get(&pc).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pc_ic_map_skips_push_immediates() {
        // PUSH1 0x80 PUSH2 0x0001 JUMPDEST STOP
        let code = [0x60, 0x80, 0x61, 0x00, 0x01, 0x5b, 0x00];
        let map = PcIcMap::new(&code);
        assert_eq!(map.len(), 4);
        assert_eq!(map.get(0), Some(0));
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(2), Some(1));
        assert_eq!(map.get(5), Some(2));
        assert_eq!(map.get(6), Some(3));
    }

    #[test]
    fn test_truncated_push_at_end() {
        // PUSH4 with only two immediate bytes left
        let code = [0x00, 0x63, 0xaa, 0xbb];
        let map = PcIcMap::new(&code);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.get(2), None);
    }

    #[test]
    fn test_opcode_classes() {
        assert!(is_depth_increasing_opcode(CALL));
        assert!(is_depth_increasing_opcode(CREATE2));
        assert!(!is_depth_increasing_opcode(SSTORE));
        assert_eq!(log_topics(LOG0), Some(0));
        assert_eq!(log_topics(LOG4), Some(4));
        assert_eq!(log_topics(SSTORE), None);
    }
}
