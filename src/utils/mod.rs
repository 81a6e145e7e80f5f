//! Shared helpers for the client and its binary.

pub mod bootstrap;
pub mod retry;
