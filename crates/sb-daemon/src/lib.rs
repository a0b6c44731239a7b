//! Switchboard daemon: serves the command surface and runs retention sweeps.

pub mod daemon;
pub mod sweeper;
