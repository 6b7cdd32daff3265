//! Core types shared by every keel crate.
//!
//! - [`Error`] / [`Result`]: typed failures for file and configuration handling
//! - [`LogResultExt`]: log-and-discard combinators for side effects
//! - [`config`]: format-agnostic config file loading and serde helpers

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;

pub use config::{load_file, ConfigFormat};
pub use error::Error;
pub use result::{LogResultExt, Result};
