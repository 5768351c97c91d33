// packages/engine/src/utils/mod.rs
//! Shared utilities: error types and configuration loading.

pub mod config;
pub mod errors;
