//! Shared helpers for integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

pub mod fake_backend;
pub mod socket_guard;
