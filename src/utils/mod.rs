//! Shared helpers for the library and its binaries.

pub mod bootstrap;
pub mod retry;
