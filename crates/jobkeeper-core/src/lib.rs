//! Shared configuration and error types for every jobkeeper crate.

pub mod config;
pub mod error;

pub use config::JobkeeperConfig;
pub use error::{JobkeeperError, Result};
