//! Core types and constants shared across veil crates.
//!
//! This crate provides:
//! - Default configuration values
//! - Byte-count formatting for connection logs
//! - Stream primitives (rewindable wrapper, bidirectional splice)

pub mod defaults;
pub mod fmt;
pub mod io;

pub use fmt::fmt_bytes;

/// Project name.
pub const PROJECT_NAME: &str = "veil";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
