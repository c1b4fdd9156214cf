//! Purpose: Library crate backing the `dockerdb-reader` CLI and its tests.
//! Exports: `core` (bolt page reader, cursors, errors), `dump` (bucket walk and JSON rendering).
//! Role: Internal library for the binary; not a general-purpose bolt implementation.
//! Invariants: Nothing in this crate writes to an inspected database file.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod core;
pub mod dump;
