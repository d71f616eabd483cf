//! Hardware-specific tests requiring real serial devices.
//!
//! These tests are ignored by default and need `TEST_PORT` (or
//! `[testing] port` in `spwrap.toml`) to do anything.

pub mod real_port_tests;
pub mod utils;
