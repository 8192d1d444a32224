//! A lock-free hierarchical summary over one or more bitset "planes".
//!
//! # Layout
//!
//! A logical bitset of `leaf_bits` bits is stored as an array of 64-bit leaf
//! words. Every internal level summarizes the level below it: bit `i` of an
//! internal word is set iff word `i` of the child level is non-zero. A find
//! can therefore skip over large empty regions by consulting a parent word
//! instead of scanning leaf words one by one.
//!
//! Up to two planes of identical shape share one allocation. Plane 0 is used
//! by the slot table as its availability index and plane 1 as its non-empty
//! hint.
//!
//! # Hints, not truths
//!
//! Set and clear propagate through the levels with detached atomic RMWs, so a
//! summary bit may be stale-set: a traversal that descends into a child word
//! must re-read it and move on if it turns out to be zero. Conversely, a
//! completed `set` guarantees all ancestor words are non-zero, so a set leaf
//! bit is never hidden from a traversal that starts at or before it.

use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;

/// The number of bits per summary word.
pub const WORD_BITS: usize = u64::BITS as usize;

const LEVEL_SHIFT: usize = 6;
const MAX_PLANES: usize = 2;
const MAX_LEVELS: usize = (WORD_BITS + (LEVEL_SHIFT - 1)) / LEVEL_SHIFT;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Mode
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The storage mode, chosen once at construction from the leaf bit count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    /// No bits, no storage; every operation is a no-op.
    Empty,
    /// At most one word per plane, stored inline.
    SingleWord,
    /// Multiple words per plane plus summary levels, stored in one allocation.
    Tree,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// BitmapTree
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hierarchical atomic bitset with up to two planes.
#[derive(Debug)]
pub struct BitmapTree {
    mode: Mode,
    leaf_bits: usize,
    planes: usize,
    words_per_plane: usize,
    single: [AtomicU64; MAX_PLANES],
    level_words: ArrayVec<usize, MAX_LEVELS>,
    level_offsets: ArrayVec<usize, MAX_LEVELS>,
    tree: Box<[AtomicU64]>,
}

/********** impl Default **************************************************************************/

impl Default for BitmapTree {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

/********** impl inherent *************************************************************************/

impl BitmapTree {
    /// Creates a tree with no bits and no storage.
    #[inline]
    pub fn empty() -> Self {
        Self {
            mode: Mode::Empty,
            leaf_bits: 0,
            planes: 0,
            words_per_plane: 0,
            single: [AtomicU64::new(0), AtomicU64::new(0)],
            level_words: ArrayVec::new(),
            level_offsets: ArrayVec::new(),
            tree: Box::default(),
        }
    }

    /// Creates a tree of `leaf_bits` bits with `planes` planes, all clear.
    ///
    /// `planes` is clamped to 2; `leaf_bits == 0` or `planes == 0` yields the
    /// empty tree.
    pub fn new(leaf_bits: usize, planes: usize) -> Self {
        if leaf_bits == 0 || planes == 0 {
            return Self::empty();
        }

        let planes = planes.min(MAX_PLANES);
        let mut tree = Self::empty();
        tree.leaf_bits = leaf_bits;
        tree.planes = planes;

        if leaf_bits <= WORD_BITS {
            tree.mode = Mode::SingleWord;
            return tree;
        }

        tree.mode = Mode::Tree;
        tree.build_layout();
        tree
    }

    /// Returns the number of leaf bits per plane.
    #[inline]
    pub fn leaf_bits(&self) -> usize {
        self.leaf_bits
    }

    /// Returns the number of planes.
    #[inline]
    pub fn planes(&self) -> usize {
        self.planes
    }

    /// Sets every bit of `plane`.
    ///
    /// Not linearizable with respect to concurrent set/clear calls; intended
    /// for (re-)initialization.
    pub fn reset_all_set(&self, plane: usize) -> bool {
        if plane >= self.planes {
            return false;
        }

        match self.mode {
            Mode::Empty => false,
            Mode::SingleWord => {
                self.single[plane].store(tail_mask(self.leaf_bits), Ordering::Relaxed);
                true
            }
            Mode::Tree => {
                for level in 0..self.levels() {
                    let bits = self.level_bits(level);
                    let full_words = bits / WORD_BITS;
                    let rem_bits = bits % WORD_BITS;

                    for word in 0..full_words {
                        self.word(plane, level, word).store(u64::MAX, Ordering::Relaxed);
                    }
                    if rem_bits != 0 {
                        let mask = (1u64 << rem_bits) - 1;
                        self.word(plane, level, full_words).store(mask, Ordering::Relaxed);
                    }
                }
                true
            }
        }
    }

    /// Clears every bit of `plane`.
    ///
    /// Not linearizable with respect to concurrent set/clear calls; intended
    /// for (re-)initialization.
    pub fn reset_all_clear(&self, plane: usize) -> bool {
        if plane >= self.planes {
            return false;
        }

        match self.mode {
            Mode::Empty => false,
            Mode::SingleWord => {
                self.single[plane].store(0, Ordering::Relaxed);
                true
            }
            Mode::Tree => {
                let base = plane * self.words_per_plane;
                for word in &self.tree[base..base + self.words_per_plane] {
                    word.store(0, Ordering::Relaxed);
                }
                true
            }
        }
    }

    /// Sets bit `bit` of `plane` and propagates into the summary levels.
    ///
    /// Returns `true` iff the bit changed. Out-of-range inputs are ignored.
    pub fn set(&self, bit: usize, plane: usize) -> bool {
        if bit >= self.leaf_bits || plane >= self.planes {
            return false;
        }

        match self.mode {
            Mode::Empty => false,
            Mode::SingleWord => {
                let flag = 1u64 << bit;
                self.single[plane].fetch_or(flag, Ordering::Relaxed) & flag == 0
            }
            Mode::Tree => self.set_bit(plane, 0, bit),
        }
    }

    /// Clears bit `bit` of `plane` and propagates into the summary levels.
    ///
    /// Returns `true` iff the bit changed. Out-of-range inputs are ignored.
    pub fn clear(&self, bit: usize, plane: usize) -> bool {
        if bit >= self.leaf_bits || plane >= self.planes {
            return false;
        }

        match self.mode {
            Mode::Empty => false,
            Mode::SingleWord => {
                let flag = 1u64 << bit;
                self.single[plane].fetch_and(!flag, Ordering::Relaxed) & flag != 0
            }
            Mode::Tree => self.clear_bit(plane, 0, bit),
        }
    }

    /// Returns whether bit `bit` of `plane` is currently set.
    pub fn test(&self, bit: usize, plane: usize) -> bool {
        if bit >= self.leaf_bits || plane >= self.planes {
            return false;
        }

        match self.mode {
            Mode::Empty => false,
            Mode::SingleWord => self.single[plane].load(Ordering::Acquire) & (1u64 << bit) != 0,
            Mode::Tree => {
                let word = self.word(plane, 0, bit / WORD_BITS).load(Ordering::Acquire);
                word & (1u64 << (bit % WORD_BITS)) != 0
            }
        }
    }

    /// Counts the set leaf bits of `plane`.
    pub fn count(&self, plane: usize) -> usize {
        if plane >= self.planes {
            return 0;
        }

        match self.mode {
            Mode::Empty => 0,
            Mode::SingleWord => self.single[plane].load(Ordering::Acquire).count_ones() as usize,
            Mode::Tree => (0..self.level_words[0])
                .map(|w| self.word(plane, 0, w).load(Ordering::Acquire).count_ones() as usize)
                .sum(),
        }
    }

    /// Finds any set bit of `plane`, preferring the first at or after
    /// `hint % leaf_bits` and wrapping around to the front on a miss.
    pub fn find(&self, hint: usize, plane: usize) -> Option<usize> {
        if plane >= self.planes {
            return None;
        }

        match self.mode {
            Mode::Empty => None,
            Mode::SingleWord => {
                let word = self.single[plane].load(Ordering::Acquire);
                if word == 0 {
                    return None;
                }
                let start = hint % self.leaf_bits;
                let masked = word & (u64::MAX << start);
                let masked = if masked != 0 { masked } else { word };
                Some(masked.trailing_zeros() as usize)
            }
            Mode::Tree => {
                let start = hint % self.leaf_bits;
                self.find_from_leaf(plane, start).or_else(|| {
                    if start != 0 {
                        self.find_from_leaf(plane, 0)
                    } else {
                        None
                    }
                })
            }
        }
    }

    /// Finds the first set bit of `plane` at or after `start`, without
    /// wrapping.
    pub fn find_next(&self, start: usize, plane: usize) -> Option<usize> {
        if plane >= self.planes || start >= self.leaf_bits {
            return None;
        }

        match self.mode {
            Mode::Empty => None,
            Mode::SingleWord => {
                let masked = self.single[plane].load(Ordering::Acquire) & (u64::MAX << start);
                if masked == 0 {
                    return None;
                }
                Some(masked.trailing_zeros() as usize)
            }
            Mode::Tree => self.find_from_leaf(plane, start),
        }
    }

    #[inline]
    fn levels(&self) -> usize {
        self.level_words.len()
    }

    /// Returns the number of valid bits at `level` (leaf bits at level 0, one
    /// bit per child word above).
    #[inline]
    fn level_bits(&self, level: usize) -> usize {
        if level == 0 {
            self.leaf_bits
        } else {
            self.level_words[level - 1]
        }
    }

    #[inline]
    fn word(&self, plane: usize, level: usize, word_index: usize) -> &AtomicU64 {
        &self.tree[plane * self.words_per_plane + self.level_offsets[level] + word_index]
    }

    fn build_layout(&mut self) {
        let mut level_bits = self.leaf_bits;
        while self.level_words.len() < MAX_LEVELS {
            let word_count = (level_bits + WORD_BITS - 1) / WORD_BITS;
            self.level_words.push(word_count);
            if word_count == 1 {
                break;
            }
            level_bits = word_count;
        }

        let mut offset = 0;
        for level in 0..self.levels() {
            self.level_offsets.push(offset);
            offset += self.level_words[level];
        }

        self.words_per_plane = offset;
        let total_words = self.words_per_plane * self.planes;
        self.tree = (0..total_words).map(|_| AtomicU64::new(0)).collect();
    }

    fn set_bit(&self, plane: usize, level: usize, bit: usize) -> bool {
        let word_index = bit / WORD_BITS;
        let flag = 1u64 << (bit % WORD_BITS);
        let old = self.word(plane, level, word_index).fetch_or(flag, Ordering::Relaxed);

        if old & flag != 0 {
            return false;
        }

        // the word went from empty to non-empty, so the parent summary bit
        // may still be clear
        if old == 0 && level + 1 < self.levels() {
            let _ = self.set_bit(plane, level + 1, word_index);
        }

        true
    }

    fn clear_bit(&self, plane: usize, level: usize, bit: usize) -> bool {
        let word_index = bit / WORD_BITS;
        let flag = 1u64 << (bit % WORD_BITS);
        let old = self.word(plane, level, word_index).fetch_and(!flag, Ordering::Relaxed);

        if old & flag == 0 {
            return false;
        }

        // a concurrent set may re-populate the word between this observation
        // and the parent clear, leaving a stale-set summary bit; traversals
        // re-read child words to compensate
        if old & !flag == 0 && level + 1 < self.levels() {
            let _ = self.clear_bit(plane, level + 1, word_index);
        }

        true
    }

    /// Finds the first set bit at or after `start_bit` within `level`,
    /// consulting the parent level to skip runs of empty words.
    fn find_next_set_bit(&self, plane: usize, level: usize, start_bit: usize) -> Option<usize> {
        let bits = self.level_bits(level);
        if start_bit >= bits {
            return None;
        }

        let words = self.level_words[level];
        let mut word_index = start_bit / WORD_BITS;
        if word_index >= words {
            return None;
        }

        let mut word_mask = u64::MAX << (start_bit % WORD_BITS);
        while word_index < words {
            let word = self.word(plane, level, word_index).load(Ordering::Acquire) & word_mask;
            word_mask = u64::MAX;

            if word != 0 {
                let idx = word_index * WORD_BITS + word.trailing_zeros() as usize;
                return (idx < bits).then_some(idx);
            }

            if level + 1 >= self.levels() {
                word_index += 1;
                continue;
            }

            // ask the parent for the next non-zero word, then re-read it,
            // since the summary bit may be stale-set
            let mut search = word_index + 1;
            let mut advanced = false;
            while search < words {
                let next_word = self.find_next_set_bit(plane, level + 1, search)?;
                if next_word >= words {
                    return None;
                }
                if self.word(plane, level, next_word).load(Ordering::Acquire) != 0 {
                    word_index = next_word;
                    advanced = true;
                    break;
                }
                search = next_word + 1;
            }

            if !advanced {
                return None;
            }
        }

        None
    }

    /// Tree-mode find starting from leaf bit `start`.
    fn find_from_leaf(&self, plane: usize, start: usize) -> Option<usize> {
        let leaf_words = self.level_words[0];
        let leaf_word = start / WORD_BITS;
        if leaf_word >= leaf_words {
            return None;
        }

        let first = self.word(plane, 0, leaf_word).load(Ordering::Acquire);
        let masked = first & (u64::MAX << (start % WORD_BITS));
        if masked != 0 {
            let idx = leaf_word * WORD_BITS + masked.trailing_zeros() as usize;
            return (idx < self.leaf_bits).then_some(idx);
        }

        let mut search = leaf_word + 1;
        while search < leaf_words {
            let next_word = self.find_next_set_bit(plane, 1, search)?;
            if next_word >= leaf_words {
                return None;
            }

            let word = self.word(plane, 0, next_word).load(Ordering::Acquire);
            if word != 0 {
                let idx = next_word * WORD_BITS + word.trailing_zeros() as usize;
                return (idx < self.leaf_bits).then_some(idx);
            }

            search = next_word + 1;
        }

        None
    }
}

/// Returns the all-ones mask for the low `bits` bits of a word.
#[inline]
fn tail_mask(bits: usize) -> u64 {
    if bits >= WORD_BITS {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;
    use rand::prelude::*;

    use super::{BitmapTree, WORD_BITS};

    #[test]
    fn empty_tree() {
        let tree = BitmapTree::empty();
        assert_eq!(tree.leaf_bits(), 0);
        assert_eq!(tree.planes(), 0);
        assert!(!tree.set(0, 0));
        assert!(!tree.clear(0, 0));
        assert_matches!(tree.find(0, 0), None);
        assert_matches!(tree.find_next(0, 0), None);
    }

    #[test]
    fn zero_sized_is_empty() {
        let tree = BitmapTree::new(0, 1);
        assert_eq!(tree.leaf_bits(), 0);
        assert_matches!(tree.find(17, 0), None);
    }

    #[test]
    fn planes_are_clamped() {
        let tree = BitmapTree::new(16, 7);
        assert_eq!(tree.planes(), 2);
    }

    #[test]
    fn single_word_set_clear() {
        let tree = BitmapTree::new(WORD_BITS, 1);
        assert!(tree.set(3, 0));
        assert!(!tree.set(3, 0));
        assert!(tree.test(3, 0));
        assert_eq!(tree.count(0), 1);

        assert!(tree.clear(3, 0));
        assert!(!tree.clear(3, 0));
        assert!(!tree.test(3, 0));
        assert_eq!(tree.count(0), 0);

        // out of range
        assert!(!tree.set(WORD_BITS, 0));
        assert!(!tree.set(0, 1));
    }

    #[test]
    fn single_word_find_wraps() {
        let tree = BitmapTree::new(WORD_BITS, 1);
        assert!(tree.reset_all_set(0));

        assert_matches!(tree.find(63, 0), Some(63));
        // hint == leaf_bits wraps to the front
        assert_matches!(tree.find(64, 0), Some(0));

        assert_matches!(tree.find_next(63, 0), Some(63));
        assert_matches!(tree.find_next(64, 0), None);
    }

    #[test]
    fn single_word_find_prefers_hint() {
        let tree = BitmapTree::new(32, 1);
        tree.set(2, 0);
        tree.set(20, 0);

        assert_matches!(tree.find(0, 0), Some(2));
        assert_matches!(tree.find(3, 0), Some(20));
        assert_matches!(tree.find(21, 0), Some(2));
    }

    #[test]
    fn reset_all_set_respects_tail() {
        let tree = BitmapTree::new(100, 1);
        assert!(tree.reset_all_set(0));
        assert_eq!(tree.count(0), 100);
        assert_matches!(tree.find_next(99, 0), Some(99));
        assert_matches!(tree.find_next(0, 0), Some(0));

        assert!(tree.reset_all_clear(0));
        assert_eq!(tree.count(0), 0);
        assert_matches!(tree.find_next(0, 0), None);
    }

    #[test]
    fn tree_mode_propagation() {
        // 65 leaf words, three levels
        let tree = BitmapTree::new(4160, 1);
        for bit in [0, 2000, 4096, 4159] {
            assert!(tree.set(bit, 0));
        }

        assert_matches!(tree.find_next(0, 0), Some(0));
        assert_matches!(tree.find_next(1, 0), Some(2000));
        assert_matches!(tree.find_next(2001, 0), Some(4096));
        assert_matches!(tree.find_next(4097, 0), Some(4159));

        // 4159 shares the leaf word with 4096, so the summary stays set
        assert!(tree.clear(4096, 0));
        assert_matches!(tree.find_next(4097, 0), Some(4159));

        assert!(tree.clear(4159, 0));
        assert_matches!(tree.find_next(4097, 0), None);
        assert_matches!(tree.find_next(0, 0), Some(0));
    }

    #[test]
    fn tree_mode_wrapping_find() {
        let tree = BitmapTree::new(1000, 1);
        tree.set(5, 0);
        assert_matches!(tree.find(900, 0), Some(5));
        assert_matches!(tree.find_next(900, 0), None);
    }

    #[test]
    fn planes_are_independent() {
        let tree = BitmapTree::new(4160, 2);
        tree.set(100, 0);
        tree.set(200, 1);

        assert_matches!(tree.find_next(0, 0), Some(100));
        assert_matches!(tree.find_next(0, 1), Some(200));
        assert!(tree.clear(100, 0));
        assert_matches!(tree.find_next(0, 0), None);
        assert_matches!(tree.find_next(0, 1), Some(200));
    }

    #[test]
    fn randomized_against_model() {
        let mut rng = StdRng::seed_from_u64(0xb17);
        let bits = 777;
        let tree = BitmapTree::new(bits, 1);
        let mut model = vec![false; bits];

        for _ in 0..10_000 {
            let bit = rng.gen_range(0..bits);
            if rng.gen_bool(0.5) {
                assert_eq!(tree.set(bit, 0), !model[bit]);
                model[bit] = true;
            } else {
                assert_eq!(tree.clear(bit, 0), model[bit]);
                model[bit] = false;
            }

            let start = rng.gen_range(0..bits);
            let expected = (start..bits).find(|&b| model[b]);
            assert_eq!(tree.find_next(start, 0), expected);
        }

        assert_eq!(tree.count(0), model.iter().filter(|&&b| b).count());
    }
}
