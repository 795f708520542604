//! Eager reference-counting baselines.
//!
//! Two strategies that free an object the instant its count hits zero,
//! sharing the deferred core's handle contract so the three strategies can be
//! compared on identical workloads:
//!
//! - [`SerialCount`]: a plain cell. Single-threaded by construction, since
//!   the counter is `!Sync` and handles over it cannot cross threads.
//! - [`AtomicCount`]: retain is a relaxed `fetch_add`; release is an
//!   acquire/release `fetch_sub`, dropping the object when the pre-decrement
//!   value was one.
//!
//! For eager strategies the destructor-side release coincides with the
//! mutator-side release, so [`EagerRef`] serves as both the stack-scoped and
//! the embedded-field handle flavor. Objects built this way are assembled
//! bottom-up (children moved into the parent's fields) and drop recursively.
//!
//! No thread guard or runtime is involved; these types are self-contained.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A counter an eager handle can drive.
pub trait EagerCount: Default + 'static {
    /// Record one new reference.
    fn increment(&self);

    /// Record one dropped reference; returns `true` when it was the last.
    #[must_use]
    fn decrement(&self) -> bool;
}

/// Unsynchronized counter for single-threaded use.
#[derive(Default)]
pub struct SerialCount(Cell<usize>);

impl EagerCount for SerialCount {
    fn increment(&self) {
        self.0.set(self.0.get() + 1);
    }

    fn decrement(&self) -> bool {
        let remaining = self.0.get() - 1;
        self.0.set(remaining);
        remaining == 0
    }
}

/// Atomic counter safe for concurrent handles.
#[derive(Default)]
pub struct AtomicCount(AtomicUsize);

impl EagerCount for AtomicCount {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// An object owned through eager handles.
///
/// Implementors embed a counter (starting at zero, like the deferred header)
/// and hand it back from [`count`](EagerManaged::count); [`EagerRef::alloc`]
/// performs the caller's initial retain.
pub trait EagerManaged: 'static {
    /// The counting strategy.
    type Count: EagerCount;

    /// The object's counter.
    fn count(&self) -> &Self::Count;
}

/// An owning handle that frees its target when the count reaches zero.
pub struct EagerRef<T: EagerManaged> {
    ptr: Option<NonNull<T>>,
}

impl<T: EagerManaged> EagerRef<T> {
    /// A null handle.
    pub const fn null() -> Self {
        Self { ptr: None }
    }

    /// Move `value` onto the heap and retain it.
    pub fn alloc(value: T) -> Self {
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        unsafe { ptr.as_ref() }.count().increment();
        Self { ptr: Some(ptr) }
    }

    /// Borrow the target, or `None` for a null handle.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // Safety: a non-null handle holds a count that keeps the target live.
        self.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// Whether this handle is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }
}

impl<T: EagerManaged> Clone for EagerRef<T> {
    fn clone(&self) -> Self {
        if let Some(ptr) = self.ptr {
            unsafe { ptr.as_ref() }.count().increment();
        }
        Self { ptr: self.ptr }
    }
}

impl<T: EagerManaged> Default for EagerRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: EagerManaged> Drop for EagerRef<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            if unsafe { ptr.as_ref() }.count().decrement() {
                // Safety: the count reached zero, so this was the last
                // handle; nothing else can observe the object.
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            }
        }
    }
}

// Safety: sharing `&EagerRef` across threads clones and drops through the
// counter, which is only possible when the object (counter included) is
// `Sync`. `SerialCount` is `!Sync`, confining that strategy to one thread.
unsafe impl<T: EagerManaged + Sync> Sync for EagerRef<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Node<C: EagerCount> {
        count: C,
        next: EagerRef<Node<C>>,
        drops: Arc<AtomicUsize>,
    }

    impl<C: EagerCount> EagerManaged for Node<C> {
        type Count = C;

        fn count(&self) -> &C {
            &self.count
        }
    }

    impl<C: EagerCount> Drop for Node<C> {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn chain<C: EagerCount>(len: usize, drops: &Arc<AtomicUsize>) -> EagerRef<Node<C>> {
        let mut next = EagerRef::null();
        for _ in 0..len {
            next = EagerRef::alloc(Node {
                count: C::default(),
                next,
                drops: Arc::clone(drops),
            });
        }
        next
    }

    #[test]
    fn test_serial_chain_drops_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let head = chain::<SerialCount>(100, &drops);
        let copy = head.clone();
        drop(head);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(copy);
        assert_eq!(drops.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_atomic_handles_shared_across_threads() {
        let drops = Arc::new(AtomicUsize::new(0));
        let head = chain::<AtomicCount>(64, &drops);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let copy = head.clone();
                        assert!(!copy.is_null());
                    }
                });
            }
        });
        drop(head);
        assert_eq!(drops.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_null_handle_is_inert() {
        let handle: EagerRef<Node<SerialCount>> = EagerRef::null();
        assert!(handle.is_null());
        assert!(handle.get().is_none());
        drop(handle.clone());
        drop(handle);
    }
}
