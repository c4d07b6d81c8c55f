//! Common utilities and types shared across Deploy Validator components.

#![warn(clippy::pedantic)]

/// Module for the validation error taxonomy
pub mod error;

/// Module for common data types
pub mod types;

/// Module for common configuration
pub mod config;
