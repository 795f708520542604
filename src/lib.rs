//! # Lethe
//!
//! Deferred reference counting for shared object graphs.
//!
//! Mutator threads never touch a reference count. Each retain or release is a
//! pointer appended to the thread's own batch buffer; full batches flow
//! through a mutex-guarded submission queue to a single reclaimer thread,
//! which applies the deltas in generation order, nominates objects whose
//! count resolves to zero, and destroys them once every batch that could
//! still resurrect them has been applied.
//!
//! - **Handles**: [`Local`] for stack scopes, [`Field`] for edges embedded in
//!   managed objects. Both retain on acquisition; they differ only in the
//!   release their drop produces.
//! - **Thread guards**: every mutator thread brackets its handle use with a
//!   [`ThreadGuard`] from [`Runtime::guard`].
//! - **Lifecycle**: [`start`] runs a root mutator to completion and returns
//!   once every reachable-count-zero object has been destroyed.
//! - **Baselines**: the [`eager`] module carries the two classical
//!   free-on-zero strategies for comparison on identical workloads.
//!
//! ```text
//!  mutator threads                     reclaimer thread
//!  ┌────────────┐  full / guard exit   ┌──────────────────────────┐
//!  │ open batch │ ───────────────────▶ │ apply → nominate → drain │
//!  │ inc ▲ dec  │   submission queue   │        → delete          │
//!  └────────────┘ ◀─────────────────── └──────────────────────────┘
//!                     batch pool
//! ```
//!
//! Reference cycles are not collected; they are reported as a live-object
//! count at shutdown and otherwise leak silently.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod batch;
mod counter;
mod handle;
mod reclaim;
mod station;

pub mod config;
pub mod eager;

pub use config::{ConfigError, ReclaimConfig};
pub use counter::Header;
pub use handle::{Field, Local, Managed};
pub use reclaim::{start, start_with_config, ReclaimStats, Runtime};
pub use station::ThreadGuard;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
