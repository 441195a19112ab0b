//! Purpose: Shared core library crate used by the `devgate` CLI and tests.
//! Exports: `api` (gate, session manager, platforms, errors), `record` (session records).
//! Role: Library backing the binary; hosts and tests embed gates through `api`.
//! Invariants: No process-wide state; every gate is an explicit value owned by its host.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
mod core;
pub mod record;
