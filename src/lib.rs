//! EMBER SNIPER: block-by-block Prometheans mint watcher
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod chain;
pub mod relay;
pub mod engine;
