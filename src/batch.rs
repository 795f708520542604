//! Dual-ended batch buffer for pending reference-count events.
//!
//! A batch is a fixed-capacity slab owned by one mutator thread. Retains are
//! recorded from slot 0 upward, releases from the last slot downward; the
//! batch is full when the two cursors meet. A full batch (or a partial one at
//! thread-guard exit) is handed to the reclaimer through the submission
//! queue, applied, and then recycled through the batch pool with its cursors
//! reset to the ends.

use crate::counter::Generation;
use crate::handle::Erased;

/// One mutator's buffer of pending retain/release events.
pub(crate) struct Batch {
    slots: Box<[Option<Erased>]>,
    /// Next increment slot; grows upward from zero.
    inc: usize,
    /// Boundary of the decrement region; grows downward from `slots.len()`.
    dec: usize,
    /// Generation assigned when this batch was claimed by a mutator.
    start_gen: Generation,
}

impl Batch {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 2);
        let slots: Box<[Option<Erased>]> = vec![None; capacity].into_boxed_slice();
        let dec = slots.len();
        Self {
            slots,
            inc: 0,
            dec,
            start_gen: 0,
        }
    }

    /// Rewind the cursors to the ends and stamp a fresh start generation.
    /// Stale slot contents beyond the cursors are never read.
    pub(crate) fn reset(&mut self, start_gen: Generation) {
        self.inc = 0;
        self.dec = self.slots.len();
        self.start_gen = start_gen;
    }

    /// Record a retain. Returns `true` when the batch became full.
    pub(crate) fn push_inc(&mut self, obj: Erased) -> bool {
        debug_assert!(self.inc < self.dec);
        self.slots[self.inc] = Some(obj);
        self.inc += 1;
        self.inc == self.dec
    }

    /// Record a release. Returns `true` when the batch became full.
    pub(crate) fn push_dec(&mut self, obj: Erased) -> bool {
        debug_assert!(self.inc < self.dec);
        self.dec -= 1;
        self.slots[self.dec] = Some(obj);
        self.inc == self.dec
    }

    pub(crate) fn start_gen(&self) -> Generation {
        self.start_gen
    }

    pub(crate) fn increment_len(&self) -> usize {
        self.inc
    }

    pub(crate) fn decrement_len(&self) -> usize {
        self.slots.len() - self.dec
    }

    pub(crate) fn increments(&self) -> impl Iterator<Item = Erased> + '_ {
        self.slots[..self.inc].iter().filter_map(|slot| *slot)
    }

    pub(crate) fn decrements(&self) -> impl Iterator<Item = Erased> + '_ {
        self.slots[self.dec..].iter().filter_map(|slot| *slot)
    }
}

// Safety: a batch is owned by exactly one mutator thread while open, then
// transferred through the mutex-guarded submission queue to the reclaimer.
// The pointers it holds refer to `Managed` (`Send + Sync`) objects.
unsafe impl Send for Batch {}
