// src/error.rs

use thiserror::Error;

/// Core error types for Lineage
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// The database was created with a different flavor than the one requested
    #[error("Database flavor mismatch: stored {stored}, requested {requested}")]
    FlavorMismatch { stored: String, requested: String },

    /// A 20-byte identifier could not be parsed
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// A revision's root subtree exceeded the configured node limit
    #[error("Max directory size exceeded ({size}): {directory}")]
    DirectoryTooLarge { directory: String, size: usize },

    /// Malformed CSV rows, journal lines, archive fixtures, etc.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias using Lineage's Error type
pub type Result<T> = std::result::Result<T, Error>;
