//! Smart handles over managed objects.
//!
//! Two flavors exist, identical except for what their drop produces:
//!
//! - [`Local`]: a stack- or argument-scoped handle. Retains through the
//!   current thread's batch on acquisition and clone, releases through the
//!   batch on drop.
//! - [`Field`]: a handle embedded inside another managed object. Retains and
//!   re-assigns like `Local`, but its drop runs only inside the enclosing
//!   object's destructor on the reclaimer thread, so it releases through the
//!   reclaimer's direct path instead of a batch.
//!
//! Both flavors permit null; retain and release are no-ops on null. Handle
//! use requires an active [`ThreadGuard`](crate::ThreadGuard) scope on the
//! current thread.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::counter::Header;
use crate::{reclaim, station};

/// A reference-counted object managed by the deferred reclaimer.
///
/// Implementors embed a [`Header`] and hand it back from [`header`]. The
/// header must be freshly constructed for each object; a new object encodes a
/// count of zero and is retained by [`Local::alloc`] on behalf of its caller.
///
/// Objects are allocated on mutator threads and destroyed on the reclaimer
/// thread, and may be traversed from several mutators at once, hence the
/// `Send + Sync` bounds.
///
/// [`header`]: Managed::header
pub trait Managed: Send + Sync + 'static {
    /// The object's counter header.
    fn header(&self) -> &Header;
}

/// Type-erased pointer to a managed object, as stored in batches and queues.
pub(crate) type Erased = NonNull<dyn Managed>;

#[inline]
pub(crate) fn erase<T: Managed>(ptr: NonNull<T>) -> Erased {
    // Safety: `ptr` is non-null by construction; the cast only unsizes.
    unsafe { NonNull::new_unchecked(ptr.as_ptr() as *mut dyn Managed) }
}

/// An owning, stack-scoped handle.
///
/// `Local` is shareable by reference across threads (`Sync`): a second
/// mutator may clone it under its own thread guard, producing the retain on
/// that thread's batch. It is not `Send`: the release a handle produces on
/// drop belongs to the thread that drops it.
pub struct Local<T: Managed> {
    ptr: Option<NonNull<T>>,
}

impl<T: Managed> Local<T> {
    /// A null handle. Dropping it is a no-op and needs no thread guard.
    pub const fn null() -> Self {
        Self { ptr: None }
    }

    /// Move `value` onto the heap and retain it.
    ///
    /// The object's header must be freshly constructed ([`Header::new`]).
    ///
    /// # Panics
    ///
    /// Panics if the current thread has no active thread guard.
    pub fn alloc(value: T) -> Self {
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        station::record_alloc();
        station::retain(erase(ptr));
        Self { ptr: Some(ptr) }
    }

    /// Adopt a raw pointer to a live managed object, retaining it.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an object allocated through [`Local::alloc`] that
    /// has not been reclaimed, and something must keep it unreclaimed until
    /// the retain recorded here is applied: a live handle elsewhere, an
    /// unapplied retain, or the fact that its last release was submitted no
    /// earlier than the current thread's open batch was claimed (nominations
    /// are blocked behind every batch open when they are made).
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        station::retain(erase(ptr));
        Self { ptr: Some(ptr) }
    }

    /// Borrow the target, or `None` for a null handle.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // Safety: a non-null handle holds a retain that keeps the target live
        // at least until this handle drops.
        self.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// The raw target pointer, or `None` for a null handle.
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    /// Whether this handle is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }
}

impl<T: Managed> Clone for Local<T> {
    fn clone(&self) -> Self {
        if let Some(ptr) = self.ptr {
            station::retain(erase(ptr));
        }
        Self { ptr: self.ptr }
    }
}

impl<T: Managed> Default for Local<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Managed> Drop for Local<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            station::release(erase(ptr));
        }
    }
}

impl<T: Managed> From<&Field<T>> for Local<T> {
    fn from(field: &Field<T>) -> Self {
        field.to_local()
    }
}

// Safety: `&Local` only permits reads and clone; clone retains through the
// *cloning* thread's own batch, which is exactly the cross-thread contract.
unsafe impl<T: Managed> Sync for Local<T> {}

/// A handle embedded as a field of another managed object.
///
/// Assignment goes through the mutator batch like [`Local`]; only the drop
/// differs, routing to the reclaimer's direct release because field handles
/// are destroyed solely from within the enclosing object's destructor.
pub struct Field<T: Managed> {
    ptr: Cell<Option<NonNull<T>>>,
}

impl<T: Managed> Field<T> {
    /// A null field.
    pub const fn null() -> Self {
        Self {
            ptr: Cell::new(None),
        }
    }

    /// Point this field at `src`'s target, retaining the new target and
    /// releasing the previous one through the current thread's batch.
    ///
    /// # Panics
    ///
    /// Panics if the current thread has no active thread guard.
    pub fn set(&self, src: &Local<T>) {
        if let Some(ptr) = src.as_ptr() {
            station::retain(erase(ptr));
        }
        if let Some(old) = self.ptr.get() {
            station::release(erase(old));
        }
        self.ptr.set(src.as_ptr());
    }

    /// Null this field, releasing the previous target through the batch.
    pub fn clear(&self) {
        if let Some(old) = self.ptr.replace(None) {
            station::release(erase(old));
        }
    }

    /// Borrow the target, or `None` for a null field.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // Safety: the field's retain keeps the target live while the
        // enclosing object is live, and `&self` borrows the enclosing object.
        self.ptr.get().map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// An owning [`Local`] handle on the target (retains it).
    pub fn to_local(&self) -> Local<T> {
        match self.ptr.get() {
            Some(ptr) => {
                station::retain(erase(ptr));
                Local { ptr: Some(ptr) }
            }
            None => Local::null(),
        }
    }

    /// Whether this field is null.
    pub fn is_null(&self) -> bool {
        self.ptr.get().is_none()
    }
}

impl<T: Managed> Default for Field<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Managed> Drop for Field<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.get() {
            reclaim::reclaimer_release(erase(ptr));
        }
    }
}

// Safety: fields are written only while the enclosing object is confined to
// the thread constructing it; after publication to other threads the graph is
// read-only until the reclaimer destroys it. This mirrors the counter word's
// single-writer discipline. `Send` is what lets the enclosing object travel
// from its allocating mutator to the reclaimer that drops it; the target is
// itself `Send + Sync` by the `Managed` bound.
unsafe impl<T: Managed> Send for Field<T> {}
unsafe impl<T: Managed> Sync for Field<T> {}
