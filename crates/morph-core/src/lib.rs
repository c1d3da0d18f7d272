//! Shared error and configuration types for the morph IR fuzzing workspace.

pub mod config;
pub mod error;

pub use config::*;
pub use error::{Error, Result};
