//! Command implementations for the Trackforge CLI.

pub mod checkpoints;
pub mod train;
