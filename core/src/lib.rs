//! # Xenos GPU emulation core utilities
//!
//! Emulator-agnostic building blocks shared by the graphics crate:
//! - [`pool`] - submission-gated recycling of GPU objects
//! - [`profiling`] - optional Tracy instrumentation

pub mod pool;
pub mod profiling;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
