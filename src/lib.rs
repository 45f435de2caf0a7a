//! ARBITER: marketplace spread arbitrage pipeline
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod engine;
pub mod sources;
pub mod storage;
pub mod strategy;
pub mod types;
