//! Deterministic, pure logic for the requirement store.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod changelog;
pub mod events;
pub mod invariants;
pub mod replay;
pub mod types;
