//! Error types for the engine core.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A scale name that is not in the scale table.
    #[error("Unknown scale: {0}")]
    UnknownScale(String),

    /// A mutation rule referencing a bad parameter or range.
    #[error("Invalid mutation rule for '{parameter}': {reason}")]
    InvalidMutationRule { parameter: String, reason: String },

    /// An ambient profile name that is not built in.
    #[error("Unknown ambient profile: {0}")]
    UnknownAmbientProfile(String),

    /// IO error (config file reads).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}
