//! Counter word encoding and the per-object header.
//!
//! Every managed object carries one machine word. The two low bits tag how
//! the rest of the word is interpreted:
//!
//! | Low bits | Meaning |
//! |----------|---------|
//! | `00`     | Plain count: a signed reference count scaled by 4. |
//! | `01`     | Nomination tag: the generation at which the object was nominated for deletion. |
//!
//! A word of exactly zero means "live, but no applied batch references it";
//! objects pass through that state transiently and are nominated on the spot.
//! Generations are multiples of 4, so a tagged word never collides with a
//! plain count and never equals zero.

use std::cell::UnsafeCell;

/// Raw counter word. Arithmetic on plain counts wraps, which keeps negative
/// counts (more applied releases than retains) representable without a
/// separate sign.
pub(crate) type Word = usize;

/// A batch start generation. Always a multiple of [`GEN_STRIDE`].
pub(crate) type Generation = usize;

/// Bit marking a word as a nomination tag.
pub(crate) const NOMINATED_BIT: Word = 0b01;

/// Mask over the two tag bits of a word.
pub(crate) const TAG_MASK: Word = 0b11;

/// Distance between consecutive generations, chosen so the two low bits of a
/// generation are always free for tagging.
pub(crate) const GEN_STRIDE: Generation = 4;

/// Delta applied to a plain count for one retain.
pub(crate) const RETAIN_STEP: Word = 4;

/// Delta applied to a plain count for one release. `RETAIN_STEP + RELEASE_STEP`
/// wraps to zero.
pub(crate) const RELEASE_STEP: Word = RETAIN_STEP.wrapping_neg();

/// Whether a word carries a nomination tag rather than a plain count.
#[inline]
pub(crate) fn is_nominated(word: Word) -> bool {
    word & NOMINATED_BIT != 0
}

/// The tagged word written into a nominated object's header.
#[inline]
pub(crate) fn tag_word(generation: Generation) -> Word {
    debug_assert_eq!(generation % GEN_STRIDE, 0);
    generation | NOMINATED_BIT
}

/// Per-object counter header.
///
/// Embed one `Header` in every managed object and hand it back from
/// [`Managed::header`](crate::Managed::header). A freshly constructed header
/// encodes a count of zero; the allocating caller must retain the object
/// immediately (which [`Local::alloc`](crate::Local::alloc) does).
///
/// The word is not atomic. Mutators never touch it (they only append
/// pointers to their batch), and after the first submission every read and
/// write happens on the reclaimer thread. Batch hand-off through the
/// submission mutex orders the construction-time write before any reclaimer
/// access.
pub struct Header {
    word: UnsafeCell<Word>,
}

impl Header {
    /// A header encoding a count of zero.
    pub const fn new() -> Self {
        Self {
            word: UnsafeCell::new(0),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> Word {
        // Safety: single-writer discipline, see the type docs.
        unsafe { *self.word.get() }
    }

    #[inline]
    pub(crate) fn store(&self, word: Word) {
        // Safety: single-writer discipline, see the type docs.
        unsafe { *self.word.get() = word }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the word is written on the owning mutator only before the object is
// first submitted, and exclusively on the reclaimer thread afterwards. The
// submission queue's mutex provides the hand-off ordering.
unsafe impl Send for Header {}
unsafe impl Sync for Header {}
