//! CLI command implementations.

pub mod config;
pub mod control;
pub mod start;
