// src/db/schema.rs

//! Database schema definitions and migrations for Lineage
//!
//! The schema depends on the storage flavor recorded at creation time: the
//! three path-carrying relation tables either reference interned locations
//! (with-path) or omit them entirely (without-path), and are laid out
//! either one-row-per-edge (normalized) or one-row-per-source with JSON
//! arrays of destinations (denormalized).

use crate::db::types::DbFlavor;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Record the storage flavor, or verify it if already recorded
pub fn init_flavor(conn: &Connection, flavor: DbFlavor) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dbflavor (flavor TEXT NOT NULL)",
        [],
    )?;
    match read_flavor(conn)? {
        None => {
            conn.execute("INSERT INTO dbflavor (flavor) VALUES (?1)", [flavor.as_str()])?;
            Ok(())
        }
        Some(stored) if stored == flavor => Ok(()),
        Some(stored) => Err(Error::FlavorMismatch {
            stored: stored.as_str().to_string(),
            requested: flavor.as_str().to_string(),
        }),
    }
}

fn read_flavor(conn: &Connection) -> Result<Option<DbFlavor>> {
    let flavor: Option<String> = conn
        .query_row("SELECT flavor FROM dbflavor LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match flavor {
        Some(s) => {
            let flavor = s
                .parse::<DbFlavor>()
                .map_err(Error::InitError)?;
            Ok(Some(flavor))
        }
        None => Ok(None),
    }
}

/// Get the flavor the database was created with
pub fn get_flavor(conn: &Connection) -> Result<DbFlavor> {
    match read_flavor(conn) {
        Ok(Some(flavor)) => Ok(flavor),
        Ok(None) => Err(Error::InitError(
            "Database has no recorded flavor; run init first".to_string(),
        )),
        Err(Error::Database(rusqlite::Error::SqliteFailure(_, _))) => Err(Error::InitError(
            "Database has no recorded flavor; run init first".to_string(),
        )),
        Err(err) => Err(err),
    }
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("Schema is up to date");
        return Ok(());
    }

    let flavor = get_flavor(conn)?;

    // Apply migrations in order
    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version, flavor)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32, flavor: DbFlavor) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn, flavor),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Creates the entity tables of the provenance model:
/// - content: blobs with their earliest known author date
/// - directory: directories with their date in the isochrone frontier and
///   a flag tracking whether their flat model was materialized
/// - revision: revisions with their author date and preferred origin
/// - origin: remote repositories, addressed by the hash of their URL
/// - location: interned relation paths
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- Origins: remote repositories, keyed by the sha1 of their URL
        CREATE TABLE origin (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sha1 BLOB NOT NULL UNIQUE,
            url TEXT NOT NULL
        );

        -- Contents: blobs, with the earliest date they were ever seen at.
        -- Bare rows (NULL date) are created when a relation references a
        -- blob before its date is known.
        CREATE TABLE content (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sha1 BLOB NOT NULL UNIQUE,
            date INTEGER
        );

        -- Directories in the isochrone frontier. The flat flag only ever
        -- transitions 0 -> 1.
        CREATE TABLE directory (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sha1 BLOB NOT NULL UNIQUE,
            date INTEGER,
            flat INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_directory_flat ON directory(flat);

        -- Revisions with their author date and preferred origin
        CREATE TABLE revision (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sha1 BLOB NOT NULL UNIQUE,
            date INTEGER,
            origin INTEGER REFERENCES origin(id)
        );

        -- Interned relation paths
        CREATE TABLE location (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path BLOB NOT NULL UNIQUE
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Relation tables
///
/// The layout of the three path-carrying relations depends on the flavor;
/// the two history relations are identical across flavors.
fn migrate_v2(conn: &Connection, flavor: DbFlavor) -> Result<()> {
    debug!("Migrating to schema version 2 ({})", flavor.as_str());

    match flavor {
        DbFlavor::WithPath => conn.execute_batch(
            "
            CREATE TABLE content_in_revision (
                content INTEGER NOT NULL REFERENCES content(id),
                revision INTEGER NOT NULL REFERENCES revision(id),
                location INTEGER NOT NULL REFERENCES location(id)
            );
            CREATE UNIQUE INDEX idx_content_in_revision
                ON content_in_revision(content, revision, location);

            CREATE TABLE content_in_directory (
                content INTEGER NOT NULL REFERENCES content(id),
                directory INTEGER NOT NULL REFERENCES directory(id),
                location INTEGER NOT NULL REFERENCES location(id)
            );
            CREATE UNIQUE INDEX idx_content_in_directory
                ON content_in_directory(content, directory, location);

            CREATE TABLE directory_in_revision (
                directory INTEGER NOT NULL REFERENCES directory(id),
                revision INTEGER NOT NULL REFERENCES revision(id),
                location INTEGER NOT NULL REFERENCES location(id)
            );
            CREATE UNIQUE INDEX idx_directory_in_revision
                ON directory_in_revision(directory, revision, location);
            CREATE INDEX idx_directory_in_revision_dir
                ON directory_in_revision(directory);
            ",
        )?,
        DbFlavor::WithoutPath => conn.execute_batch(
            "
            CREATE TABLE content_in_revision (
                content INTEGER NOT NULL REFERENCES content(id),
                revision INTEGER NOT NULL REFERENCES revision(id)
            );
            CREATE UNIQUE INDEX idx_content_in_revision
                ON content_in_revision(content, revision);

            CREATE TABLE content_in_directory (
                content INTEGER NOT NULL REFERENCES content(id),
                directory INTEGER NOT NULL REFERENCES directory(id)
            );
            CREATE UNIQUE INDEX idx_content_in_directory
                ON content_in_directory(content, directory);

            CREATE TABLE directory_in_revision (
                directory INTEGER NOT NULL REFERENCES directory(id),
                revision INTEGER NOT NULL REFERENCES revision(id)
            );
            CREATE UNIQUE INDEX idx_directory_in_revision
                ON directory_in_revision(directory, revision);
            ",
        )?,
        DbFlavor::WithPathDenormalized => conn.execute_batch(
            "
            -- One row per source; revision/location hold parallel JSON
            -- arrays of internal ids, deduplicated on (dst, location)
            CREATE TABLE content_in_revision (
                content INTEGER PRIMARY KEY REFERENCES content(id),
                revision TEXT NOT NULL,
                location TEXT NOT NULL
            );

            CREATE TABLE content_in_directory (
                content INTEGER PRIMARY KEY REFERENCES content(id),
                directory TEXT NOT NULL,
                location TEXT NOT NULL
            );

            CREATE TABLE directory_in_revision (
                directory INTEGER PRIMARY KEY REFERENCES directory(id),
                revision TEXT NOT NULL,
                location TEXT NOT NULL
            );
            ",
        )?,
        DbFlavor::WithoutPathDenormalized => conn.execute_batch(
            "
            CREATE TABLE content_in_revision (
                content INTEGER PRIMARY KEY REFERENCES content(id),
                revision TEXT NOT NULL
            );

            CREATE TABLE content_in_directory (
                content INTEGER PRIMARY KEY REFERENCES content(id),
                directory TEXT NOT NULL
            );

            CREATE TABLE directory_in_revision (
                directory INTEGER PRIMARY KEY REFERENCES directory(id),
                revision TEXT NOT NULL
            );
            ",
        )?,
    }

    conn.execute_batch(
        "
        CREATE TABLE revision_in_origin (
            revision INTEGER NOT NULL REFERENCES revision(id),
            origin INTEGER NOT NULL REFERENCES origin(id)
        );
        CREATE UNIQUE INDEX idx_revision_in_origin
            ON revision_in_origin(revision, origin);

        CREATE TABLE revision_before_revision (
            prev INTEGER NOT NULL REFERENCES revision(id),
            next INTEGER NOT NULL REFERENCES revision(id)
        );
        CREATE UNIQUE INDEX idx_revision_before_revision
            ON revision_before_revision(prev, next);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_db(flavor: DbFlavor) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_flavor(&conn, flavor).unwrap();
        conn
    }

    #[test]
    fn test_schema_version_tracking() {
        let conn = create_test_db(DbFlavor::WithPath);

        // Initial version should be 0
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        // Set version to 1
        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_flavor_is_recorded() {
        let conn = create_test_db(DbFlavor::WithoutPathDenormalized);
        assert_eq!(
            get_flavor(&conn).unwrap(),
            DbFlavor::WithoutPathDenormalized
        );
        // Re-recording the same flavor is fine
        init_flavor(&conn, DbFlavor::WithoutPathDenormalized).unwrap();
        // A different one is not
        assert!(matches!(
            init_flavor(&conn, DbFlavor::WithPath),
            Err(Error::FlavorMismatch { .. })
        ));
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let conn = create_test_db(DbFlavor::WithPath);
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "content",
            "directory",
            "revision",
            "origin",
            "location",
            "content_in_revision",
            "content_in_directory",
            "directory_in_revision",
            "revision_in_origin",
            "revision_before_revision",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = create_test_db(DbFlavor::WithPath);

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_without_path_has_no_location_column() {
        let conn = create_test_db(DbFlavor::WithoutPath);
        migrate(&conn).unwrap();

        let columns: Vec<String> = conn
            .prepare("SELECT name FROM pragma_table_info('content_in_revision')")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(columns.contains(&"content".to_string()));
        assert!(columns.contains(&"revision".to_string()));
        assert!(!columns.contains(&"location".to_string()));
    }

    #[test]
    fn test_relation_unique_constraint() {
        let conn = create_test_db(DbFlavor::WithoutPath);
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO content (sha1) VALUES (x'01')", [])
            .unwrap();
        conn.execute("INSERT INTO revision (sha1) VALUES (x'02')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO content_in_revision (content, revision) VALUES (1, 1)",
            [],
        )
        .unwrap();
        // Duplicate edge rejected by the unique index
        let result = conn.execute(
            "INSERT INTO content_in_revision (content, revision) VALUES (1, 1)",
            [],
        );
        assert!(result.is_err());
    }
}
