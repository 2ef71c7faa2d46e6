//! Filesystem side of the store: locking, transactions, persisted state.

pub mod codec;
pub mod config;
pub mod event_log;
pub mod init;
pub mod liveness;
pub mod lock;
pub mod paths;
pub mod transaction;
