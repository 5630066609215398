//! Errors shared by the fleet crates

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Root folder or database directory could not be created
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bootstrap TOML or a stored setting could not be read
    #[error("Configuration error: {0}")]
    Config(String),

    /// A record or enum value failed validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored data that should never fail to decode did
    #[error("Internal error: {0}")]
    Internal(String),
}
