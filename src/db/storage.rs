// src/db/storage.rs

//! Persistent provenance storage over SQLite
//!
//! All writes are date-min merges or set inserts, so replaying a batch (or
//! racing another writer on the same entities) converges to the same state.
//! Every setter applies its whole batch in one transaction and reports
//! success as a boolean; the write-through cache retries on false.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::warn;

use crate::db::schema;
use crate::db::types::{
    DbFlavor, DirectoryData, EntityKind, ProvenanceResult, RelationEdge, RelationKind,
    RevisionData,
};
use crate::error::{Error, Result};
use crate::journal::{relation_key, JournalMessage, JournalWriter};
use crate::model::Sha1Git;

/// Maximum number of ids bound into a single IN clause
const IN_CLAUSE_LIMIT: usize = 500;

/// SQLite-backed provenance storage
pub struct ProvenanceStorage {
    conn: Connection,
    flavor: DbFlavor,
    journal: Option<Box<dyn JournalWriter>>,
}

fn repeat_vars(count: usize) -> String {
    let mut vars = "?,".repeat(count);
    vars.pop();
    vars
}

fn datetime_from_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {}", secs)))
}

fn sha1_from_row(bytes: Vec<u8>) -> Result<Sha1Git> {
    Sha1Git::try_from(bytes.as_slice())
}

impl ProvenanceStorage {
    /// Open an existing database; its flavor was fixed at init time
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::db::open(db_path)?;
        let flavor = schema::get_flavor(&conn)?;
        Ok(Self {
            conn,
            flavor,
            journal: None,
        })
    }

    /// A fresh in-memory database, mostly for tests
    pub fn in_memory(flavor: DbFlavor) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::init_flavor(&conn, flavor)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn,
            flavor,
            journal: None,
        })
    }

    /// Attach a journal; subsequent additions are written to it before
    /// being persisted
    pub fn set_journal(&mut self, journal: Box<dyn JournalWriter>) {
        self.journal = Some(journal);
    }

    pub fn flavor(&self) -> DbFlavor {
        self.flavor
    }

    pub fn with_path(&self) -> bool {
        self.flavor.with_path()
    }

    // Entity setters ----------------------------------------------------

    /// Date-min merge for blobs. Returns false (after logging) on failure.
    pub fn content_set_date(&mut self, dates: &HashMap<Sha1Git, DateTime<Utc>>) -> bool {
        let result = self
            .journal_dates(dates, JournalMessage::content)
            .and_then(|_| Self::entity_set_date(&mut self.conn, "content", dates));
        self.report(result)
    }

    /// Date-min merge and monotonic flat flag for directories
    pub fn directory_set(&mut self, dirs: &HashMap<Sha1Git, DirectoryData>) -> bool {
        let result = (|| -> Result<()> {
            if dirs.is_empty() {
                return Ok(());
            }
            if let Some(journal) = self.journal.as_deref_mut() {
                for (id, data) in dirs {
                    if let Some(date) = data.date {
                        journal.write_message(JournalMessage::directory(*id, date))?;
                    }
                }
            }
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO directory (sha1, date, flat) VALUES (?1, ?2, ?3)
                     ON CONFLICT(sha1) DO UPDATE
                     SET date = MIN(COALESCE(excluded.date, directory.date),
                                    COALESCE(directory.date, excluded.date)),
                         flat = MAX(directory.flat, excluded.flat)",
                )?;
                for (sha1, data) in dirs {
                    stmt.execute(params![
                        sha1.as_bytes(),
                        data.date.map(|d| d.timestamp()),
                        data.flat,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })();
        self.report(result)
    }

    /// Date-min merge for revisions; the preferred origin is overwritten
    /// only when a non-null origin is given
    pub fn revision_set(&mut self, revs: &HashMap<Sha1Git, RevisionData>) -> bool {
        let result = (|| -> Result<()> {
            if revs.is_empty() {
                return Ok(());
            }
            if let Some(journal) = self.journal.as_deref_mut() {
                for (id, data) in revs {
                    if let Some(date) = data.date {
                        journal.write_message(JournalMessage::revision(*id, date))?;
                    }
                }
            }
            let tx = self.conn.transaction()?;
            {
                let mut date_stmt = tx.prepare_cached(
                    "INSERT INTO revision (sha1, date) VALUES (?1, ?2)
                     ON CONFLICT(sha1) DO UPDATE
                     SET date = MIN(COALESCE(excluded.date, revision.date),
                                    COALESCE(revision.date, excluded.date))",
                )?;
                let mut origin_stmt = tx.prepare_cached(
                    "INSERT INTO revision (sha1, origin)
                     SELECT ?1, O.id FROM origin AS O WHERE O.sha1 = ?2
                     ON CONFLICT(sha1) DO UPDATE SET origin = excluded.origin",
                )?;
                let mut bare_stmt =
                    tx.prepare_cached("INSERT OR IGNORE INTO revision (sha1) VALUES (?1)")?;
                for (sha1, data) in revs {
                    match (data.date, data.origin) {
                        (None, None) => {
                            bare_stmt.execute(params![sha1.as_bytes()])?;
                        }
                        (date, origin) => {
                            if let Some(date) = date {
                                date_stmt.execute(params![sha1.as_bytes(), date.timestamp()])?;
                            }
                            if let Some(origin) = origin {
                                origin_stmt
                                    .execute(params![sha1.as_bytes(), origin.as_bytes()])?;
                            }
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })();
        self.report(result)
    }

    /// Insert-if-absent for origin URLs
    pub fn origin_set(&mut self, orgs: &HashMap<Sha1Git, String>) -> bool {
        let result = (|| -> Result<()> {
            if orgs.is_empty() {
                return Ok(());
            }
            if let Some(journal) = self.journal.as_deref_mut() {
                for (id, url) in orgs {
                    journal.write_message(JournalMessage::origin(*id, url.clone()))?;
                }
            }
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx
                    .prepare_cached("INSERT OR IGNORE INTO origin (sha1, url) VALUES (?1, ?2)")?;
                for (sha1, url) in orgs {
                    stmt.execute(params![sha1.as_bytes(), url])?;
                }
            }
            tx.commit()?;
            Ok(())
        })();
        self.report(result)
    }

    /// Intern relation paths. The map keys are the hash of each path and
    /// are only used by callers for deduplication.
    pub fn location_add(&mut self, paths: &HashMap<Sha1Git, Vec<u8>>) -> bool {
        let result = (|| -> Result<()> {
            if paths.is_empty() {
                return Ok(());
            }
            let tx = self.conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare_cached("INSERT OR IGNORE INTO location (path) VALUES (?1)")?;
                for path in paths.values() {
                    stmt.execute(params![path])?;
                }
            }
            tx.commit()?;
            Ok(())
        })();
        self.report(result)
    }

    fn entity_set_date(
        conn: &mut Connection,
        table: &str,
        dates: &HashMap<Sha1Git, DateTime<Utc>>,
    ) -> Result<()> {
        if dates.is_empty() {
            return Ok(());
        }
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT INTO {table} (sha1, date) VALUES (?1, ?2)
                 ON CONFLICT(sha1) DO UPDATE
                 SET date = MIN(COALESCE(excluded.date, {table}.date),
                                COALESCE({table}.date, excluded.date))",
                table = table
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for (sha1, date) in dates {
                stmt.execute(params![sha1.as_bytes(), date.timestamp()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn journal_dates(
        &mut self,
        dates: &HashMap<Sha1Git, DateTime<Utc>>,
        message: fn(Sha1Git, DateTime<Utc>) -> JournalMessage,
    ) -> Result<()> {
        if let Some(journal) = self.journal.as_deref_mut() {
            for (id, date) in dates {
                journal.write_message(message(*id, *date))?;
            }
        }
        Ok(())
    }

    fn report(&self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!("Storage write failed: {}", err);
                false
            }
        }
    }

    // Entity getters ----------------------------------------------------

    /// Earliest dates of the given blobs; undated ids are absent
    pub fn content_get(&self, ids: &[Sha1Git]) -> Result<HashMap<Sha1Git, DateTime<Utc>>> {
        self.entity_get_date("content", ids)
    }

    /// Frontier data of the given directories; undated ids are absent
    pub fn directory_get(&self, ids: &[Sha1Git]) -> Result<HashMap<Sha1Git, DirectoryData>> {
        let mut result = HashMap::new();
        for chunk in ids.chunks(IN_CLAUSE_LIMIT) {
            let sql = format!(
                "SELECT sha1, date, flat FROM directory
                 WHERE date IS NOT NULL AND sha1 IN ({})",
                repeat_vars(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.as_bytes().to_vec())),
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )?;
            for row in rows {
                let (sha1, secs, flat) = row?;
                result.insert(
                    sha1_from_row(sha1)?,
                    DirectoryData {
                        date: Some(datetime_from_secs(secs)?),
                        flat,
                    },
                );
            }
        }
        Ok(result)
    }

    /// Unflattened known directories starting at `start_id`, id-ordered
    pub fn directory_iter_not_flattened(
        &self,
        limit: usize,
        start_id: Sha1Git,
    ) -> Result<Vec<Sha1Git>> {
        let mut stmt = self.conn.prepare(
            "SELECT sha1 FROM directory
             WHERE flat = 0 AND date IS NOT NULL AND sha1 >= ?1
             ORDER BY sha1 LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![start_id.as_bytes(), limit as i64], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(sha1_from_row(row?)?);
        }
        Ok(ids)
    }

    /// Date and preferred origin of the given revisions; ids with neither
    /// are absent
    pub fn revision_get(&self, ids: &[Sha1Git]) -> Result<HashMap<Sha1Git, RevisionData>> {
        let mut result = HashMap::new();
        for chunk in ids.chunks(IN_CLAUSE_LIMIT) {
            let sql = format!(
                "SELECT R.sha1, R.date, O.sha1
                 FROM revision AS R
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE (R.date IS NOT NULL OR R.origin IS NOT NULL)
                   AND R.sha1 IN ({})",
                repeat_vars(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.as_bytes().to_vec())),
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )?;
            for row in rows {
                let (sha1, secs, origin) = row?;
                let date = secs.map(datetime_from_secs).transpose()?;
                let origin = origin.map(|o| sha1_from_row(o)).transpose()?;
                result.insert(sha1_from_row(sha1)?, RevisionData { date, origin });
            }
        }
        Ok(result)
    }

    /// URLs of the given origins
    pub fn origin_get(&self, ids: &[Sha1Git]) -> Result<HashMap<Sha1Git, String>> {
        let mut result = HashMap::new();
        for chunk in ids.chunks(IN_CLAUSE_LIMIT) {
            let sql = format!(
                "SELECT sha1, url FROM origin WHERE sha1 IN ({})",
                repeat_vars(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.as_bytes().to_vec())),
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )?;
            for row in rows {
                let (sha1, url) = row?;
                result.insert(sha1_from_row(sha1)?, url);
            }
        }
        Ok(result)
    }

    /// All interned paths, keyed by their hash. For tests.
    pub fn location_get_all(&self) -> Result<HashMap<Sha1Git, Vec<u8>>> {
        let mut stmt = self.conn.prepare("SELECT path FROM location")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut result = HashMap::new();
        for row in rows {
            let path = row?;
            result.insert(Sha1Git::digest(&path), path);
        }
        Ok(result)
    }

    /// All ids of one entity type. For tests.
    pub fn entity_get_all(&self, entity: EntityKind) -> Result<BTreeSet<Sha1Git>> {
        let sql = format!("SELECT sha1 FROM {}", entity.table());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut result = BTreeSet::new();
        for row in rows {
            result.insert(sha1_from_row(row?)?);
        }
        Ok(result)
    }

    fn entity_get_date(
        &self,
        table: &str,
        ids: &[Sha1Git],
    ) -> Result<HashMap<Sha1Git, DateTime<Utc>>> {
        let mut result = HashMap::new();
        for chunk in ids.chunks(IN_CLAUSE_LIMIT) {
            let sql = format!(
                "SELECT sha1, date FROM {} WHERE date IS NOT NULL AND sha1 IN ({})",
                table,
                repeat_vars(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.as_bytes().to_vec())),
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            )?;
            for row in rows {
                let (sha1, secs) = row?;
                result.insert(sha1_from_row(sha1)?, datetime_from_secs(secs)?);
            }
        }
        Ok(result)
    }

    // Relations ----------------------------------------------------------

    /// Insert edges into one relation, creating bare entity rows and
    /// interned locations as needed. Set semantics: re-inserting an
    /// existing edge is a no-op.
    pub fn relation_add(
        &mut self,
        kind: RelationKind,
        data: &HashMap<Sha1Git, BTreeSet<RelationEdge>>,
    ) -> bool {
        let result = self.try_relation_add(kind, data);
        self.report(result)
    }

    fn try_relation_add(
        &mut self,
        kind: RelationKind,
        data: &HashMap<Sha1Git, BTreeSet<RelationEdge>>,
    ) -> Result<()> {
        if data.values().all(|edges| edges.is_empty()) {
            return Ok(());
        }
        if let Some(journal) = self.journal.as_deref_mut() {
            for (src, edges) in data {
                for edge in edges {
                    journal.write_message(JournalMessage::relation(
                        kind,
                        relation_key(*src, edge.dst, edge.path.as_deref()),
                        *src,
                        edge.dst,
                        edge.path.clone(),
                    ))?;
                }
            }
        }

        let use_location = kind.uses_location() && self.flavor.with_path();
        let denormalized = kind.uses_location() && self.flavor.denormalized();
        let tx = self.conn.transaction()?;
        {
            // Relations may reference entities that have no date yet;
            // create their bare rows so the internal-id joins resolve.
            // Origins carry a non-null URL and are always inserted first.
            if kind.src() != EntityKind::Origin {
                let sql = format!(
                    "INSERT OR IGNORE INTO {} (sha1) VALUES (?1)",
                    kind.src().table()
                );
                let mut stmt = tx.prepare_cached(&sql)?;
                for src in data.keys() {
                    stmt.execute(params![src.as_bytes()])?;
                }
            }
            if kind.dst() != EntityKind::Origin {
                let sql = format!(
                    "INSERT OR IGNORE INTO {} (sha1) VALUES (?1)",
                    kind.dst().table()
                );
                let mut stmt = tx.prepare_cached(&sql)?;
                for edges in data.values() {
                    for edge in edges {
                        stmt.execute(params![edge.dst.as_bytes()])?;
                    }
                }
            }
            if use_location {
                let mut stmt =
                    tx.prepare_cached("INSERT OR IGNORE INTO location (path) VALUES (?1)")?;
                for edges in data.values() {
                    for edge in edges {
                        stmt.execute(params![edge.path.as_deref().unwrap_or(b"")])?;
                    }
                }
            }

            if denormalized {
                Self::relation_insert_denormalized(&tx, kind, data, use_location)?;
            } else {
                Self::relation_insert_normalized(&tx, kind, data, use_location)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn relation_insert_normalized(
        tx: &rusqlite::Transaction<'_>,
        kind: RelationKind,
        data: &HashMap<Sha1Git, BTreeSet<RelationEdge>>,
        use_location: bool,
    ) -> Result<()> {
        let sql = if use_location {
            format!(
                "INSERT OR IGNORE INTO {table} ({src_col}, {dst_col}, location)
                 SELECT S.id, D.id, L.id
                 FROM {src} AS S, {dst} AS D, location AS L
                 WHERE S.sha1 = ?1 AND D.sha1 = ?2 AND L.path = ?3",
                table = kind.table(),
                src_col = kind.src_column(),
                dst_col = kind.dst_column(),
                src = kind.src().table(),
                dst = kind.dst().table(),
            )
        } else {
            format!(
                "INSERT OR IGNORE INTO {table} ({src_col}, {dst_col})
                 SELECT S.id, D.id
                 FROM {src} AS S, {dst} AS D
                 WHERE S.sha1 = ?1 AND D.sha1 = ?2",
                table = kind.table(),
                src_col = kind.src_column(),
                dst_col = kind.dst_column(),
                src = kind.src().table(),
                dst = kind.dst().table(),
            )
        };
        let mut stmt = tx.prepare_cached(&sql)?;
        for (src, edges) in data {
            for edge in edges {
                if use_location {
                    stmt.execute(params![
                        src.as_bytes(),
                        edge.dst.as_bytes(),
                        edge.path.as_deref().unwrap_or(b""),
                    ])?;
                } else {
                    stmt.execute(params![src.as_bytes(), edge.dst.as_bytes()])?;
                }
            }
        }
        Ok(())
    }

    fn relation_insert_denormalized(
        tx: &rusqlite::Transaction<'_>,
        kind: RelationKind,
        data: &HashMap<Sha1Git, BTreeSet<RelationEdge>>,
        use_location: bool,
    ) -> Result<()> {
        let id_sql = |table: &str| format!("SELECT id FROM {} WHERE sha1 = ?1", table);
        let src_id_sql = id_sql(kind.src().table());
        let dst_id_sql = id_sql(kind.dst().table());
        let loc_id_sql = "SELECT id FROM location WHERE path = ?1";
        let select_sql = if use_location {
            format!(
                "SELECT {dst_col}, location FROM {table} WHERE {src_col} = ?1",
                table = kind.table(),
                src_col = kind.src_column(),
                dst_col = kind.dst_column(),
            )
        } else {
            format!(
                "SELECT {dst_col} FROM {table} WHERE {src_col} = ?1",
                table = kind.table(),
                src_col = kind.src_column(),
                dst_col = kind.dst_column(),
            )
        };
        let upsert_sql = if use_location {
            format!(
                "INSERT INTO {table} ({src_col}, {dst_col}, location) VALUES (?1, ?2, ?3)
                 ON CONFLICT({src_col}) DO UPDATE
                 SET {dst_col} = excluded.{dst_col}, location = excluded.location",
                table = kind.table(),
                src_col = kind.src_column(),
                dst_col = kind.dst_column(),
            )
        } else {
            format!(
                "INSERT INTO {table} ({src_col}, {dst_col}) VALUES (?1, ?2)
                 ON CONFLICT({src_col}) DO UPDATE
                 SET {dst_col} = excluded.{dst_col}",
                table = kind.table(),
                src_col = kind.src_column(),
                dst_col = kind.dst_column(),
            )
        };

        for (src, edges) in data {
            if edges.is_empty() {
                continue;
            }
            let src_id: i64 =
                tx.query_row(&src_id_sql, params![src.as_bytes()], |row| row.get(0))?;

            // Merge into the existing arrays, deduplicating (dst, location)
            let mut pairs: Vec<(i64, Option<i64>)> = Vec::new();
            let existing: Option<(String, Option<String>)> = if use_location {
                tx.query_row(&select_sql, params![src_id], |row| {
                    Ok((row.get::<_, String>(0)?, Some(row.get::<_, String>(1)?)))
                })
                .optional()?
            } else {
                tx.query_row(&select_sql, params![src_id], |row| {
                    Ok((row.get::<_, String>(0)?, None))
                })
                .optional()?
            };
            if let Some((dst_json, loc_json)) = existing {
                let dsts: Vec<i64> = serde_json::from_str(&dst_json)
                    .map_err(|e| Error::InvalidInput(format!("corrupt dst array: {}", e)))?;
                let locs: Vec<Option<i64>> = match loc_json {
                    Some(json) => serde_json::from_str::<Vec<i64>>(&json)
                        .map_err(|e| Error::InvalidInput(format!("corrupt location array: {}", e)))?
                        .into_iter()
                        .map(Some)
                        .collect(),
                    None => vec![None; dsts.len()],
                };
                pairs.extend(dsts.into_iter().zip(locs));
            }

            for edge in edges {
                let dst_id: i64 =
                    tx.query_row(&dst_id_sql, params![edge.dst.as_bytes()], |row| row.get(0))?;
                let loc_id = if use_location {
                    let path = edge.path.as_deref().unwrap_or(b"");
                    Some(tx.query_row(loc_id_sql, params![path], |row| row.get::<_, i64>(0))?)
                } else {
                    None
                };
                if !pairs.contains(&(dst_id, loc_id)) {
                    pairs.push((dst_id, loc_id));
                }
            }

            let dsts: Vec<i64> = pairs.iter().map(|p| p.0).collect();
            let dst_json = serde_json::to_string(&dsts)
                .map_err(|e| Error::InvalidInput(e.to_string()))?;
            if use_location {
                let locs: Vec<i64> = pairs.iter().map(|p| p.1.unwrap_or(0)).collect();
                let loc_json = serde_json::to_string(&locs)
                    .map_err(|e| Error::InvalidInput(e.to_string()))?;
                tx.execute(&upsert_sql, params![src_id, dst_json, loc_json])?;
            } else {
                tx.execute(&upsert_sql, params![src_id, dst_json])?;
            }
        }
        Ok(())
    }

    /// Edges of one relation whose source (or destination, with `reverse`)
    /// is among `ids`, keyed by source
    pub fn relation_get(
        &self,
        kind: RelationKind,
        ids: &[Sha1Git],
        reverse: bool,
    ) -> Result<HashMap<Sha1Git, BTreeSet<RelationEdge>>> {
        let mut result = HashMap::new();
        for chunk in ids.chunks(IN_CLAUSE_LIMIT) {
            let selector = if reverse { "D.sha1" } else { "S.sha1" };
            let filter = format!("{} IN ({})", selector, repeat_vars(chunk.len()));
            let sql = self.relation_select_sql(kind, Some(&filter));
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.as_bytes().to_vec())),
                Self::relation_row,
            )?;
            Self::collect_relation_rows(rows, &mut result)?;
        }
        Ok(result)
    }

    /// Every edge of one relation. For tests.
    pub fn relation_get_all(
        &self,
        kind: RelationKind,
    ) -> Result<HashMap<Sha1Git, BTreeSet<RelationEdge>>> {
        let sql = self.relation_select_sql(kind, None);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::relation_row)?;
        let mut result = HashMap::new();
        Self::collect_relation_rows(rows, &mut result)?;
        Ok(result)
    }

    #[allow(clippy::type_complexity)]
    fn relation_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }

    fn collect_relation_rows(
        rows: impl Iterator<Item = rusqlite::Result<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)>>,
        result: &mut HashMap<Sha1Git, BTreeSet<RelationEdge>>,
    ) -> Result<()> {
        for row in rows {
            let (src, dst, path) = row?;
            result
                .entry(sha1_from_row(src)?)
                .or_default()
                .insert(RelationEdge {
                    dst: sha1_from_row(dst)?,
                    path,
                });
        }
        Ok(())
    }

    fn relation_select_sql(&self, kind: RelationKind, filter: Option<&str>) -> String {
        let use_location = kind.uses_location() && self.flavor.with_path();
        let denormalized = kind.uses_location() && self.flavor.denormalized();
        let path_select = if use_location { "L.path" } else { "NULL" };
        let where_clause = |extra: &str| -> String {
            match (extra.is_empty(), filter) {
                (true, None) => String::new(),
                (true, Some(filter)) => format!("WHERE {}", filter),
                (false, None) => format!("WHERE {}", extra),
                (false, Some(filter)) => format!("WHERE {} AND {}", extra, filter),
            }
        };
        if denormalized {
            let location_joins = if use_location {
                "INNER JOIN json_each(R.location) AS JL\n                 INNER JOIN location AS L ON (L.id = JL.value)"
            } else {
                ""
            };
            let pairing = if use_location { "JL.key = JD.key" } else { "" };
            format!(
                "SELECT S.sha1, D.sha1, {path_select}
                 FROM {table} AS R
                 INNER JOIN {src} AS S ON (S.id = R.{src_col})
                 INNER JOIN json_each(R.{dst_col}) AS JD
                 {location_joins}
                 INNER JOIN {dst} AS D ON (D.id = JD.value)
                 {where_clause}",
                path_select = path_select,
                table = kind.table(),
                src = kind.src().table(),
                src_col = kind.src_column(),
                dst_col = kind.dst_column(),
                location_joins = location_joins,
                dst = kind.dst().table(),
                where_clause = where_clause(pairing),
            )
        } else {
            let location_join = if use_location {
                "INNER JOIN location AS L ON (L.id = R.location)"
            } else {
                ""
            };
            format!(
                "SELECT S.sha1, D.sha1, {path_select}
                 FROM {table} AS R
                 INNER JOIN {src} AS S ON (S.id = R.{src_col})
                 INNER JOIN {dst} AS D ON (D.id = R.{dst_col})
                 {location_join}
                 {where_clause}",
                path_select = path_select,
                table = kind.table(),
                src = kind.src().table(),
                src_col = kind.src_column(),
                dst = kind.dst().table(),
                dst_col = kind.dst_column(),
                location_join = location_join,
                where_clause = where_clause(""),
            )
        }
    }

    // Queries ------------------------------------------------------------

    /// First occurrence of a blob under the `(date, revision, origin,
    /// path)` order, or None if the blob is unknown
    pub fn content_find_first(&self, id: Sha1Git) -> Result<Option<ProvenanceResult>> {
        Ok(self.find_occurrences(id, Some(1))?.into_iter().next())
    }

    /// All occurrences of a blob under the same order, up to `limit`
    pub fn content_find_all(
        &self,
        id: Sha1Git,
        limit: Option<usize>,
    ) -> Result<Vec<ProvenanceResult>> {
        self.find_occurrences(id, limit)
    }

    fn find_occurrences(
        &self,
        id: Sha1Git,
        limit: Option<usize>,
    ) -> Result<Vec<ProvenanceResult>> {
        // Result columns: blob(1), rev(2), date(3), url(4), path(5)
        let sql = format!(
            "{direct}\nUNION\n{indirect}\nORDER BY 3, 2, 4, 5 LIMIT ?2",
            direct = self.direct_occurrence_sql(),
            indirect = self.indirect_occurrence_sql(),
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![id.as_bytes(), limit], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get_ref(4)?.as_bytes()?.to_vec(),
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (content, revision, secs, origin, path) = row?;
            results.push(ProvenanceResult {
                content: sha1_from_row(content)?,
                revision: sha1_from_row(revision)?,
                date: datetime_from_secs(secs)?,
                origin,
                path,
            });
        }
        Ok(results)
    }

    fn direct_occurrence_sql(&self) -> String {
        match (self.flavor.with_path(), self.flavor.denormalized()) {
            (true, false) => "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url, L.path AS path
                 FROM content AS C
                 INNER JOIN content_in_revision AS CR ON (CR.content = C.id)
                 INNER JOIN location AS L ON (L.id = CR.location)
                 INNER JOIN revision AS R ON (R.id = CR.revision)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE R.date IS NOT NULL AND C.sha1 = ?1"
                .to_string(),
            (true, true) => "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url, L.path AS path
                 FROM content AS C
                 INNER JOIN content_in_revision AS CR ON (CR.content = C.id)
                 INNER JOIN json_each(CR.revision) AS JR
                 INNER JOIN json_each(CR.location) AS JL
                 INNER JOIN revision AS R ON (R.id = JR.value)
                 INNER JOIN location AS L ON (L.id = JL.value)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE JL.key = JR.key AND R.date IS NOT NULL AND C.sha1 = ?1"
                .to_string(),
            (false, false) => "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url, x'' AS path
                 FROM content AS C
                 INNER JOIN content_in_revision AS CR ON (CR.content = C.id)
                 INNER JOIN revision AS R ON (R.id = CR.revision)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE R.date IS NOT NULL AND C.sha1 = ?1"
                .to_string(),
            (false, true) => "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url, x'' AS path
                 FROM content AS C
                 INNER JOIN content_in_revision AS CR ON (CR.content = C.id)
                 INNER JOIN json_each(CR.revision) AS JR
                 INNER JOIN revision AS R ON (R.id = JR.value)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE R.date IS NOT NULL AND C.sha1 = ?1"
                .to_string(),
        }
    }

    fn indirect_occurrence_sql(&self) -> String {
        // An empty or "." directory path leaves the content path unchanged
        const PATH_CASE: &str = "CASE DL.path WHEN x'' THEN CL.path WHEN x'2e' THEN CL.path
                      ELSE (DL.path || x'2f' || CL.path) END";
        match (self.flavor.with_path(), self.flavor.denormalized()) {
            (true, false) => format!(
                "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url,
                        {path_case} AS path
                 FROM content AS C
                 INNER JOIN content_in_directory AS CD ON (CD.content = C.id)
                 INNER JOIN directory_in_revision AS DR ON (DR.directory = CD.directory)
                 INNER JOIN revision AS R ON (R.id = DR.revision)
                 INNER JOIN location AS CL ON (CL.id = CD.location)
                 INNER JOIN location AS DL ON (DL.id = DR.location)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE R.date IS NOT NULL AND C.sha1 = ?1",
                path_case = PATH_CASE,
            ),
            (true, true) => format!(
                "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url,
                        {path_case} AS path
                 FROM content AS C
                 INNER JOIN content_in_directory AS CD ON (CD.content = C.id)
                 INNER JOIN json_each(CD.directory) AS JD
                 INNER JOIN json_each(CD.location) AS JCL
                 INNER JOIN directory_in_revision AS DR ON (DR.directory = JD.value)
                 INNER JOIN json_each(DR.revision) AS JR
                 INNER JOIN json_each(DR.location) AS JDL
                 INNER JOIN revision AS R ON (R.id = JR.value)
                 INNER JOIN location AS CL ON (CL.id = JCL.value)
                 INNER JOIN location AS DL ON (DL.id = JDL.value)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE JCL.key = JD.key AND JDL.key = JR.key
                   AND R.date IS NOT NULL AND C.sha1 = ?1",
                path_case = PATH_CASE,
            ),
            (false, false) => "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url, x'' AS path
                 FROM content AS C
                 INNER JOIN content_in_directory AS CD ON (CD.content = C.id)
                 INNER JOIN directory_in_revision AS DR ON (DR.directory = CD.directory)
                 INNER JOIN revision AS R ON (R.id = DR.revision)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE R.date IS NOT NULL AND C.sha1 = ?1"
                .to_string(),
            (false, true) => "SELECT C.sha1 AS blob, R.sha1 AS rev, R.date AS date, O.url AS url, x'' AS path
                 FROM content AS C
                 INNER JOIN content_in_directory AS CD ON (CD.content = C.id)
                 INNER JOIN json_each(CD.directory) AS JD
                 INNER JOIN directory_in_revision AS DR ON (DR.directory = JD.value)
                 INNER JOIN json_each(DR.revision) AS JR
                 INNER JOIN revision AS R ON (R.id = JR.value)
                 LEFT JOIN origin AS O ON (O.id = R.origin)
                 WHERE R.date IS NOT NULL AND C.sha1 = ?1"
                .to_string(),
        }
    }
}
