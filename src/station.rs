//! Per-mutator-thread station and the thread guard scope.
//!
//! Each mutator thread owns at most one open batch, reached through a
//! thread-local station. `retain` and `release` append to the open batch
//! without any locking; only rotating a full batch takes the shared mutex,
//! briefly. A [`ThreadGuard`] brackets the region in which a thread may use
//! handles: entry claims a fresh batch (and with it the batch's start
//! generation and its place in the nomination order), exit submits the
//! current batch even if partial and clears the station.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::batch::Batch;
use crate::handle::Erased;
use crate::reclaim::Core;

thread_local! {
    static STATION: RefCell<Option<Station>> = const { RefCell::new(None) };
}

/// A mutator thread's state: the core it belongs to and its open batch.
struct Station {
    core: Arc<Core>,
    batch: Box<Batch>,
}

impl Station {
    fn push_inc(&mut self, obj: Erased) {
        if self.batch.push_inc(obj) {
            self.core.rotate(&mut self.batch);
        }
    }

    fn push_dec(&mut self, obj: Erased) {
        if self.batch.push_dec(obj) {
            self.core.rotate(&mut self.batch);
        }
    }
}

fn with_station<R>(f: impl FnOnce(&mut Station) -> R) -> R {
    STATION.with(|slot| {
        let mut slot = slot.borrow_mut();
        let station = slot
            .as_mut()
            .expect("handle used outside a thread guard scope");
        f(station)
    })
}

/// Append a retain for `obj` to the current thread's batch.
pub(crate) fn retain(obj: Erased) {
    with_station(|station| station.push_inc(obj));
}

/// Append a release for `obj` to the current thread's batch.
pub(crate) fn release(obj: Erased) {
    with_station(|station| station.push_dec(obj));
}

/// Count a fresh allocation against the live-object gauge.
pub(crate) fn record_alloc() {
    with_station(|station| {
        station.core.stats.live.fetch_add(1, Ordering::Relaxed);
    });
}

/// Submit the current thread's batch now and claim a fresh one.
pub(crate) fn flush(expected: &Arc<Core>) {
    with_station(|station| {
        assert!(
            Arc::ptr_eq(&station.core, expected),
            "flush on a runtime other than the one guarding this thread"
        );
        station.core.rotate(&mut station.batch);
    });
}

/// RAII scope during which the current thread may use handles.
///
/// Obtained from [`Runtime::guard`](crate::Runtime::guard). Nested scopes on
/// one thread are rejected. The guard must drop on the thread that created it
/// (it is not `Send`).
pub struct ThreadGuard {
    _not_send: PhantomData<*const ()>,
}

impl ThreadGuard {
    pub(crate) fn enter(core: Arc<Core>) -> Self {
        STATION.with(|slot| {
            let mut slot = slot.borrow_mut();
            assert!(
                slot.is_none(),
                "nested thread guard scopes are not supported"
            );
            let batch = core.claim();
            *slot = Some(Station { core, batch });
        });
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        STATION.with(|slot| {
            if let Some(Station { core, batch }) = slot.borrow_mut().take() {
                core.submit(batch);
            }
        });
    }
}
