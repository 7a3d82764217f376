//! Castle Common - Shared types and utilities
//!
//! This crate provides the error kinds, configuration structures and the
//! coordination-store key layout used across all castle components.

pub mod config;
pub mod error;
pub mod keys;

pub use config::Config;
pub use error::{Error, Result};
