// src/db/mod.rs

//! Database layer for Lineage
//!
//! This module handles all SQLite operations including:
//! - Database initialization and schema creation
//! - Connection management
//! - Entity and relation persistence
//! - The two provenance queries (`content_find_first` / `content_find_all`)

pub mod schema;
pub mod storage;
pub mod types;

pub use storage::ProvenanceStorage;
pub use types::{
    DbFlavor, DirectoryData, EntityKind, ProvenanceResult, RelationEdge, RelationKind,
    RevisionData,
};

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Initialize a new Lineage database at the specified path
///
/// Creates the database file, records the storage flavor and sets up the
/// schema. This is idempotent - calling it on an existing database is safe
/// as long as the flavor matches.
pub fn init(db_path: &str, flavor: DbFlavor) -> Result<()> {
    debug!("Initializing database at: {}", db_path);

    // Create parent directories if they don't exist
    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    // Set pragmas for better performance and reliability
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::init_flavor(&conn, flavor)?;
    schema::migrate(&conn)?;

    info!("Database initialized successfully ({})", flavor.as_str());
    Ok(())
}

/// Open an existing Lineage database
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        return Err(Error::DatabaseNotFound(db_path.to_string()));
    }

    let conn = Connection::open(db_path)?;

    // Set pragmas
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_init_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();

        // Remove the temp file so init can create it
        drop(temp_file);

        let result = init(&db_path, DbFlavor::WithPath);
        assert!(result.is_ok());
        assert!(Path::new(&db_path).exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        drop(temp_file);

        init(&db_path, DbFlavor::WithPath).unwrap();
        init(&db_path, DbFlavor::WithPath).unwrap();
    }

    #[test]
    fn test_init_rejects_flavor_change() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        drop(temp_file);

        init(&db_path, DbFlavor::WithPath).unwrap();
        let result = init(&db_path, DbFlavor::WithoutPath);
        assert!(matches!(result, Err(Error::FlavorMismatch { .. })));
    }

    #[test]
    fn test_open_existing_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        init(db_path, DbFlavor::WithPath).unwrap();

        let result = open(db_path);
        assert!(result.is_ok());
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open("/nonexistent/path/db.sqlite");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }
}
