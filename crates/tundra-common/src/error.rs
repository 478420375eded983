//! Tundra error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TundraError {
    /// An exception forwarded from a remote replica.
    #[error("Remote exception (code {code}): {message}")]
    Remote { code: i32, message: String },

    #[error("Unknown packet from server: {0}")]
    UnknownPacket(String),

    #[error("Duplicated part uuids: {0}")]
    DuplicatedParts(String),

    #[error("Logical error: {0}")]
    Logical(String),

    #[error("System error: {0}")]
    System(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout exceeded: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, TundraError>;
