use eyre::Result;
use foundry_compilers::artifacts::sourcemap::{self, Jump};
use serde::{Deserialize, Serialize};

use crate::{artifact::ast::SourceRange, utils::opcode::PcIcMap};

/// Jump annotation of a source map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JumpKind {
    /// Jump into a function.
    Into,
    /// Return from a function.
    Out,
    Regular,
}

impl From<Jump> for JumpKind {
    fn from(jump: Jump) -> Self {
        match jump {
            Jump::In => Self::Into,
            Jump::Out => Self::Out,
            Jump::Regular => Self::Regular,
        }
    }
}

/// One instruction's entry in the decoded source map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// `None` when the instruction has no source (file index `-1`).
    pub range: Option<SourceRange>,
    pub jump: JumpKind,
}

/// Per-instruction source table of one bytecode object.
#[derive(Clone, Debug, Default)]
pub struct SourceMapIndex {
    entries: Vec<SourceEntry>,
    pc_ic_map: PcIcMap,
}

impl SourceMapIndex {
    /// Decodes the compressed `s:l:f:j:m;...` source map of `code`.
    pub fn new(code: &[u8], source_map: &str) -> Result<Self> {
        let elements = sourcemap::parse(source_map)?;
        let entries = elements
            .iter()
            .map(|elem| SourceEntry {
                range: elem.index().map(|file| {
                    SourceRange::new(elem.offset() as usize, elem.length() as usize, file as usize)
                }),
                jump: elem.jump().into(),
            })
            .collect::<Vec<_>>();

        let pc_ic_map = PcIcMap::new(code);
        if entries.len() != pc_ic_map.len() {
            // solc omits entries for the metadata trailer, so this is common and harmless.
            trace!(
                entries = entries.len(),
                instructions = pc_ic_map.len(),
                "source map length differs from instruction count"
            );
        }

        Ok(Self { entries, pc_ic_map })
    }

    /// Instruction index of the instruction starting at `pc`.
    pub fn instruction_index(&self, pc: usize) -> Option<usize> {
        self.pc_ic_map.get(pc)
    }

    pub fn entry_at_pc(&self, pc: usize) -> Option<SourceEntry> {
        self.entries.get(self.instruction_index(pc)?).copied()
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inherited_fields_and_pc_lookup() {
        // PUSH1 0x80 PUSH1 0x40 MSTORE JUMP JUMPDEST
        let code = [0x60, 0x80, 0x60, 0x40, 0x52, 0x56, 0x5b];
        let index = SourceMapIndex::new(&code, "0:10:0:-;;2:3;:::i;1:0:-1:o").unwrap();
        assert_eq!(index.len(), 5);

        let first = index.entry_at_pc(0).unwrap();
        assert_eq!(first.range, Some(SourceRange::new(0, 10, 0)));
        assert_eq!(first.jump, JumpKind::Regular);

        // second entry inherits everything
        assert_eq!(index.entry_at_pc(2).unwrap().range, Some(SourceRange::new(0, 10, 0)));
        assert_eq!(index.entry_at_pc(4).unwrap().range, Some(SourceRange::new(2, 3, 0)));

        let jump = index.entry_at_pc(5).unwrap();
        assert_eq!(jump.range, Some(SourceRange::new(2, 3, 0)));
        assert_eq!(jump.jump, JumpKind::Into);

        let dest = index.entry_at_pc(6).unwrap();
        assert_eq!(dest.range, None);
        assert_eq!(dest.jump, JumpKind::Out);

        // push immediates are not instructions
        assert_eq!(index.entry_at_pc(1), None);
    }
}
