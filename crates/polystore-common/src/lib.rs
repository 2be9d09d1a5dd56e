//! PolyStore Common - Shared types and utilities
//!
//! This crate provides the identifiers, the columns/key range model, error
//! definitions and configuration used across all PolyStore components.

pub mod config;
pub mod error;
pub mod id;
pub mod range;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use id::IdGenerator;
pub use range::{ColumnsRange, KEY_MAX, KeyInterval};
pub use types::*;
