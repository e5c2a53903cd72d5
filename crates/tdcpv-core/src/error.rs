//! Error types for tdcpv

use thiserror::Error;

/// tdcpv error type
///
/// Every failure names the component (process, tagger, resolution, ...) that raised it, so a
/// failed run can be traced to the offending configuration entry.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing key or incompatible option combination, detected while building the model.
    #[error("Configuration error in {component}: {message}")]
    Config {
        /// Component that rejected the configuration (e.g. `tagger 'OS'`).
        component: String,
        /// What was wrong.
        message: String,
    },

    /// A generation cell produced (or was asked to produce) no events.
    #[error("Degenerate data: {0}")]
    DegenerateData(String),

    /// Validation error (numeric ranges, shapes, lengths)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

impl Error {
    /// Shorthand for a [`Error::Config`] raised by `component`.
    pub fn config(component: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config { component: component.into(), message: message.into() }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
