//! tagvm - a bytecode engine for a dynamically typed scripting language
//!
//! This library provides the NaN-boxed value model, the reference-counted
//! heap with cycle collection, and the bytecode dispatcher.

pub mod config;
pub mod loader;
pub mod vm;

// Re-export commonly used types
pub use config::{CollectorKind, RuntimeConfig, StatsFormat};
pub use loader::{LoadError, Outcome, RunError, RunReport, load_file, run_file, run_module};
pub use vm::{Engine, Module, Value, VmError};
