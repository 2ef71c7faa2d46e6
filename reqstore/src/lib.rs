//! Versioned requirement store shared by independent local processes.
//!
//! A project keeps its requirement document and the full edit history under
//! `.state/`. Writers serialize through a cross-process lock, every update is
//! an all-or-nothing directory swap, and current state is rebuilt from the
//! latest snapshot plus the events recorded after it.
//!
//! - **[`core`]**: Pure, deterministic logic (document model, events, replay,
//!   changelog indexes). No I/O.
//! - **[`io`]**: Filesystem side effects (lock, transactions, persisted log).
//!
//! [`repository::Repository`] composes both for front ends.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod repository;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Result, StoreError};
pub use repository::{CommitSummary, Delta, Repository};
