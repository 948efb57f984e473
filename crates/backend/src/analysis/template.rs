use std::ops::Range;

use alloy_primitives::Bytes;
use foundry_compilers::artifacts::Offsets;

/// Expected bytecode of a contract with per-deployment regions masked out.
///
/// Skip ranges are sorted, non-overlapping and clamped to the code length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BytecodeTemplate {
    code: Bytes,
    skip: Vec<Range<usize>>,
}

impl BytecodeTemplate {
    /// Creates a template, sorting and merging the given skip ranges.
    pub fn new(code: Bytes, ranges: impl IntoIterator<Item = Range<usize>>) -> Self {
        let mut ranges: Vec<_> = ranges
            .into_iter()
            .map(|r| r.start.min(code.len())..r.end.min(code.len()))
            .filter(|r| r.start < r.end)
            .collect();
        ranges.sort_by_key(|r| r.start);

        let mut skip: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match skip.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => skip.push(range),
            }
        }

        Self { code, skip }
    }

    /// Creates a template masking compiler-reported offsets (link and immutable references).
    pub fn from_offsets<'a>(code: Bytes, offsets: impl IntoIterator<Item = &'a Offsets>) -> Self {
        let ranges = offsets
            .into_iter()
            .map(|o| o.start as usize..o.start as usize + o.length as usize)
            .collect::<Vec<_>>();
        Self::new(code, ranges)
    }

    pub fn code(&self) -> &Bytes {
        &self.code
    }

    pub fn skip_ranges(&self) -> &[Range<usize>] {
        &self.skip
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Exact-length comparison outside the skip ranges.
    pub fn matches(&self, code: &[u8]) -> bool {
        code.len() == self.code.len() && self.matches_unmasked(code)
    }

    /// Like [`Self::matches`], but `code` may carry trailing bytes (constructor arguments).
    pub fn matches_prefix(&self, code: &[u8]) -> bool {
        code.len() >= self.code.len() && self.matches_unmasked(&code[..self.code.len()])
    }

    fn matches_unmasked(&self, code: &[u8]) -> bool {
        let mut cursor = 0;
        for range in &self.skip {
            if self.code[cursor..range.start] != code[cursor..range.start] {
                return false;
            }
            cursor = range.end;
        }
        self.code[cursor..] == code[cursor..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ranges_are_merged() {
        let template = BytecodeTemplate::new(Bytes::from(vec![0u8; 10]), [6..8, 1..3, 2..4, 9..20]);
        assert_eq!(template.skip_ranges(), &[1..4, 6..8, 9..10]);
    }

    #[test]
    fn test_prefix_match() {
        let template = BytecodeTemplate::new(Bytes::from(vec![1, 2, 3, 4]), [1..2]);
        assert!(template.matches(&[1, 9, 3, 4]));
        assert!(!template.matches(&[1, 9, 3, 4, 5]));
        assert!(template.matches_prefix(&[1, 9, 3, 4, 5]));
        assert!(!template.matches_prefix(&[1, 9, 3]));
    }

    fn template_strategy() -> impl Strategy<Value = (Vec<u8>, Vec<Range<usize>>)> {
        prop::collection::vec(any::<u8>(), 1..256).prop_flat_map(|code| {
            let len = code.len();
            // link references are 20 bytes, immutables 32, but any width must work
            let range = (0..len, 1..40usize).prop_map(|(start, width)| start..start + width);
            (Just(code), prop::collection::vec(range, 0..6))
        })
    }

    proptest! {
        #[test]
        fn test_mutation_outside_skip_ranges_breaks_match(
            (code, ranges) in template_strategy(),
            pos in any::<prop::sample::Index>(),
            delta in 1u8..=255,
        ) {
            let template = BytecodeTemplate::new(Bytes::from(code.clone()), ranges);
            prop_assert!(template.matches(&code));

            let pos = pos.index(code.len());
            let mut mutated = code.clone();
            mutated[pos] = mutated[pos].wrapping_add(delta);

            let masked = template.skip_ranges().iter().any(|r| r.contains(&pos));
            prop_assert_eq!(template.matches(&mutated), masked);
        }

        #[test]
        fn test_mutations_inside_skip_ranges_never_matter(
            (code, ranges) in template_strategy(),
            fill in any::<u8>(),
        ) {
            let template = BytecodeTemplate::new(Bytes::from(code.clone()), ranges);
            let mut mutated = code.clone();
            for range in template.skip_ranges() {
                mutated[range.clone()].fill(fill);
            }
            prop_assert!(template.matches(&mutated));
        }
    }
}
