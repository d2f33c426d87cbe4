// splat_state.rs - Selection operation types and per-splat bitset utilities
//
// Selection and deletion are stored as GPU bitsets: 4-byte words, 32 splats per
// word, bit index = splat index mod 32. Bits past the live splat count in the
// last word are always zero.

use glam::Vec2;
use rayon::prelude::*;

/// Splats per bitset word
pub const BITS_PER_WORD: u32 = 32;

/// Selection operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionOp {
    /// Replace the gesture-start selection with the new selection
    Set,
    /// Add to the gesture-start selection
    #[default]
    Add,
    /// Remove from the gesture-start selection
    Remove,
}

impl SelectionOp {
    pub fn from_subtract(subtract: bool) -> Self {
        if subtract {
            SelectionOp::Remove
        } else {
            SelectionOp::Add
        }
    }
}

/// Screen-space selection rectangle in pixels (origin top-left, +Y down)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SelectionRect {
    pub min: Vec2,
    pub max: Vec2,
}

impl SelectionRect {
    /// Build from two arbitrary corners
    pub fn from_corners(a: Vec2, b: Vec2) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }
}

/// Splat state bits written into the view data for the draw shaders
pub mod state_bits {
    /// Splat is selected (bit 0)
    pub const SELECTED: u32 = 1;
    /// Splat is deleted (bit 2)
    pub const DELETED: u32 = 4;
    /// Splat is masked by a cutout (bit 3)
    pub const CUT: u32 = 8;
}

/// Number of bitset words needed for `count` splats
#[inline]
pub fn bitset_words(count: u32) -> usize {
    count.div_ceil(BITS_PER_WORD) as usize
}

/// Mask of the valid bits in word `word` for a set of `count` splats
#[inline]
pub fn word_mask(word: usize, count: u32) -> u32 {
    let first = word as u32 * BITS_PER_WORD;
    if count >= first + BITS_PER_WORD {
        u32::MAX
    } else if count <= first {
        0
    } else {
        (1u32 << (count - first)) - 1
    }
}

#[inline]
pub fn test_bit(words: &[u32], index: u32) -> bool {
    words
        .get((index / BITS_PER_WORD) as usize)
        .is_some_and(|w| w & (1 << (index % BITS_PER_WORD)) != 0)
}

#[inline]
pub fn set_bit(words: &mut [u32], index: u32, value: bool) {
    let word = &mut words[(index / BITS_PER_WORD) as usize];
    let bit = 1 << (index % BITS_PER_WORD);
    if value {
        *word |= bit;
    } else {
        *word &= !bit;
    }
}

/// Set every live bit
pub fn set_all(words: &mut [u32], count: u32) {
    words
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, w)| *w = word_mask(i, count));
}

/// Complement every live bit; trailing bits stay zero
pub fn invert(words: &mut [u32], count: u32) {
    words
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, w)| *w = !*w & word_mask(i, count));
}

/// dst |= src
pub fn or_into(dst: &mut [u32], src: &[u32]) {
    dst.par_iter_mut().zip(src.par_iter()).for_each(|(d, s)| *d |= *s);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_mask_covers_partial_last_word() {
        assert_eq!(word_mask(0, 10), 0b11_1111_1111);
        assert_eq!(word_mask(0, 32), u32::MAX);
        assert_eq!(word_mask(1, 40), 0xff);
        assert_eq!(word_mask(2, 40), 0);
    }

    #[test]
    fn rect_from_corners_normalizes() {
        let r = SelectionRect::from_corners(Vec2::new(10.0, 2.0), Vec2::new(1.0, 20.0));
        assert_eq!(r.min, Vec2::new(1.0, 2.0));
        assert_eq!(r.max, Vec2::new(10.0, 20.0));
        assert!(r.contains(Vec2::new(5.0, 5.0)));
    }
}
