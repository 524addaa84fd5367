//! Cadence CLI library: command implementations shared by the `cadence`
//! binary and its integration tests.

pub mod commands;
