//! Common Utilities and Types Library
//!
//! This crate provides shared types and utilities used across the sidelink UE implementation.

pub mod sfnsf;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use sfnsf::*;
pub use types::*;
pub use utils::*;
