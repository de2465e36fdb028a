//! Maildrain Common - Shared configuration and error types
//!
//! This crate provides the configuration model and the error type
//! shared by the maildrain protocol core and the command-line binary.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{Error, Result};
