//! Wiring for the `stockroom` binary: argument parsing, logging setup, the
//! periodic sweeper and the redemption load simulation.

pub mod args;
pub mod simulate;
pub mod sweeper;
pub mod telemetry;
