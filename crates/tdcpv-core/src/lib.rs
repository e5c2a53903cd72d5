//! # tdcpv-core
//!
//! Core types, traits, and error handling shared by the tdcpv crates.
//!
//! This crate provides:
//! - The common [`Error`] type and [`Result`] alias
//! - The [`LogDensityModel`] trait consumed by the optimiser
//! - Fit result containers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::LogDensityModel;
pub use types::FitResult;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
