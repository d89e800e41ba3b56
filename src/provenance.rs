// src/provenance.rs

//! Write-through cache in front of the provenance storage
//!
//! One [`Provenance`] instance belongs to one ingestion worker and buffers
//! a batch of mutations. Reads go cache-first and fall back to bulk
//! storage lookups; writes accumulate until [`Provenance::flush`], which
//! serializes them in a fixed order so that a crash between steps never
//! leaves a state a re-ingestion cannot repair:
//!
//! 1. blob-in-revision rows, blob-in-directory rows, directory-in-revision
//!    rows (a reprocess after a crash will not lose blob links),
//! 2. content, directory and revision dates,
//! 3. origin URLs, revision history rows, head rows, preferred origins.
//!
//! Each step retries until the storage accepts the batch.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::db::types::{
    DirectoryData, ProvenanceResult, RelationEdge, RelationKind, RevisionData,
};
use crate::db::ProvenanceStorage;
use crate::error::Result;
use crate::model::{
    join_path, normalize_path, DirectoryEntry, FileEntry, OriginEntry, RevisionEntry, Sha1Git,
};

/// Default flush threshold for the total number of cached elements
pub const MAX_CACHE_ELEMENTS: usize = 40_000;

/// Delay between retries of a refused storage batch
const RETRY_DELAY_MS: u64 = 1000;

/// Write-through cache over a provenance storage, scoped to one batch
pub struct Provenance {
    storage: ProvenanceStorage,
    max_cache_elements: usize,

    content_dates: HashMap<Sha1Git, DateTime<Utc>>,
    content_added: HashSet<Sha1Git>,
    directory_data: HashMap<Sha1Git, DirectoryData>,
    directory_added: HashSet<Sha1Git>,
    revision_data: HashMap<Sha1Git, RevisionData>,
    revision_added: HashSet<Sha1Git>,
    origin_urls: HashMap<Sha1Git, String>,
    origin_added: HashSet<Sha1Git>,

    content_in_revision: BTreeSet<(Sha1Git, Sha1Git, Vec<u8>)>,
    content_in_directory: BTreeSet<(Sha1Git, Sha1Git, Vec<u8>)>,
    directory_in_revision: BTreeSet<(Sha1Git, Sha1Git, Vec<u8>)>,
    revision_in_origin: BTreeSet<(Sha1Git, Sha1Git)>,
    revision_before_revision: HashMap<Sha1Git, BTreeSet<Sha1Git>>,
}

impl Provenance {
    pub fn new(storage: ProvenanceStorage) -> Self {
        Self::with_cache_limit(storage, MAX_CACHE_ELEMENTS)
    }

    pub fn with_cache_limit(storage: ProvenanceStorage, max_cache_elements: usize) -> Self {
        Self {
            storage,
            max_cache_elements,
            content_dates: HashMap::new(),
            content_added: HashSet::new(),
            directory_data: HashMap::new(),
            directory_added: HashSet::new(),
            revision_data: HashMap::new(),
            revision_added: HashSet::new(),
            origin_urls: HashMap::new(),
            origin_added: HashSet::new(),
            content_in_revision: BTreeSet::new(),
            content_in_directory: BTreeSet::new(),
            directory_in_revision: BTreeSet::new(),
            revision_in_origin: BTreeSet::new(),
            revision_before_revision: HashMap::new(),
        }
    }

    pub fn storage(&self) -> &ProvenanceStorage {
        &self.storage
    }

    /// Total number of cached elements across all maps and buffers
    pub fn cache_size(&self) -> usize {
        self.content_dates.len()
            + self.directory_data.len()
            + self.revision_data.len()
            + self.origin_urls.len()
            + self.content_in_revision.len()
            + self.content_in_directory.len()
            + self.directory_in_revision.len()
            + self.revision_in_origin.len()
            + self
                .revision_before_revision
                .values()
                .map(BTreeSet::len)
                .sum::<usize>()
    }

    /// Drop every cached element without writing anything
    pub fn clear_caches(&mut self) {
        self.content_dates.clear();
        self.content_added.clear();
        self.directory_data.clear();
        self.directory_added.clear();
        self.revision_data.clear();
        self.revision_added.clear();
        self.origin_urls.clear();
        self.origin_added.clear();
        self.content_in_revision.clear();
        self.content_in_directory.clear();
        self.directory_in_revision.clear();
        self.revision_in_origin.clear();
        self.revision_before_revision.clear();
    }

    // Content ------------------------------------------------------------

    /// Record that `blob` occurs directly in `revision`, at `prefix`
    /// (the path of the directory holding it, relative to the root)
    pub fn content_add_to_revision(
        &mut self,
        revision: &RevisionEntry,
        blob: &FileEntry,
        prefix: &[u8],
    ) {
        self.content_in_revision.insert((
            blob.id,
            revision.id,
            normalize_path(&join_path(prefix, &blob.name)),
        ));
    }

    /// Record that `blob` occurs inside the frontier directory
    /// `directory`, at `prefix` relative to it
    pub fn content_add_to_directory(
        &mut self,
        directory: &DirectoryEntry,
        blob: &FileEntry,
        prefix: &[u8],
    ) {
        self.content_in_directory.insert((
            blob.id,
            directory.id,
            normalize_path(&join_path(prefix, &blob.name)),
        ));
    }

    pub fn content_get_early_date(&mut self, blob: &FileEntry) -> Result<Option<DateTime<Utc>>> {
        Ok(self.content_get_early_dates(&[blob.id])?.get(&blob.id).copied())
    }

    /// Earliest known dates for the given blobs, cache-first
    pub fn content_get_early_dates(
        &mut self,
        ids: &[Sha1Git],
    ) -> Result<HashMap<Sha1Git, DateTime<Utc>>> {
        let missing: Vec<Sha1Git> = ids
            .iter()
            .filter(|id| !self.content_dates.contains_key(*id))
            .copied()
            .collect();
        if !missing.is_empty() {
            let fetched = self.storage.content_get(&missing)?;
            self.content_dates.extend(fetched);
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.content_dates.get(id).map(|date| (*id, *date)))
            .collect())
    }

    pub fn content_set_early_date(&mut self, blob: &FileEntry, date: DateTime<Utc>) {
        self.content_dates.insert(blob.id, date);
        self.content_added.insert(blob.id);
    }

    pub fn content_find_first(&self, id: Sha1Git) -> Result<Option<ProvenanceResult>> {
        self.storage.content_find_first(id)
    }

    pub fn content_find_all(
        &self,
        id: Sha1Git,
        limit: Option<usize>,
    ) -> Result<Vec<ProvenanceResult>> {
        self.storage.content_find_all(id, limit)
    }

    // Directories --------------------------------------------------------

    /// Record `directory` as a frontier of `revision` at `path`
    /// (relative to the revision root, including the directory's name)
    pub fn directory_add_to_revision(
        &mut self,
        revision: &RevisionEntry,
        directory: &DirectoryEntry,
        path: &[u8],
    ) {
        self.directory_in_revision
            .insert((directory.id, revision.id, normalize_path(path)));
    }

    pub fn directory_get_date_in_isochrone_frontier(
        &mut self,
        directory: &DirectoryEntry,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .directory_get_dates_in_isochrone_frontier(&[directory.id])?
            .get(&directory.id)
            .copied())
    }

    pub fn directory_get_dates_in_isochrone_frontier(
        &mut self,
        ids: &[Sha1Git],
    ) -> Result<HashMap<Sha1Git, DateTime<Utc>>> {
        self.fetch_directory_data(ids)?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.directory_data
                    .get(id)
                    .and_then(|data| data.date)
                    .map(|date| (*id, date))
            })
            .collect())
    }

    pub fn directory_set_date_in_isochrone_frontier(
        &mut self,
        directory: &DirectoryEntry,
        date: DateTime<Utc>,
    ) {
        let entry = self
            .directory_data
            .entry(directory.id)
            .or_insert(DirectoryData {
                date: None,
                flat: false,
            });
        entry.date = Some(date);
        self.directory_added.insert(directory.id);
    }

    /// Whether the directory's flat model exists; None if the directory is
    /// unknown to the provenance model
    pub fn directory_already_flattened(
        &mut self,
        directory: &DirectoryEntry,
    ) -> Result<Option<bool>> {
        self.fetch_directory_data(&[directory.id])?;
        Ok(self
            .directory_data
            .get(&directory.id)
            .filter(|data| data.date.is_some())
            .map(|data| data.flat))
    }

    /// Mark the directory's flat model as materialized. No effect on
    /// directories unknown to the model.
    pub fn directory_flag_as_flattened(&mut self, directory: &DirectoryEntry) -> Result<()> {
        self.fetch_directory_data(&[directory.id])?;
        if let Some(data) = self.directory_data.get_mut(&directory.id) {
            data.flat = true;
            self.directory_added.insert(directory.id);
        }
        Ok(())
    }

    fn fetch_directory_data(&mut self, ids: &[Sha1Git]) -> Result<()> {
        let missing: Vec<Sha1Git> = ids
            .iter()
            .filter(|id| !self.directory_data.contains_key(*id))
            .copied()
            .collect();
        if !missing.is_empty() {
            let fetched = self.storage.directory_get(&missing)?;
            self.directory_data.extend(fetched);
        }
        Ok(())
    }

    // Revisions ----------------------------------------------------------

    /// Record a revision's author date; implies the revision is being
    /// processed by the revision layer
    pub fn revision_add(&mut self, revision: &RevisionEntry) {
        let entry = self.revision_data.entry(revision.id).or_default();
        entry.date = Some(revision.date);
        self.revision_added.insert(revision.id);
    }

    pub fn revision_get_date(&mut self, revision: &RevisionEntry) -> Result<Option<DateTime<Utc>>> {
        self.fetch_revision_data(&[revision.id])?;
        Ok(self
            .revision_data
            .get(&revision.id)
            .and_then(|data| data.date))
    }

    /// Associate `ancestor` to `head` as appearing in its history
    pub fn revision_add_before_revision(&mut self, head: Sha1Git, ancestor: Sha1Git) {
        self.revision_before_revision
            .entry(ancestor)
            .or_default()
            .insert(head);
    }

    /// Associate `revision` to `origin` as one of its snapshot heads
    pub fn revision_add_to_origin(&mut self, origin: &OriginEntry, revision: Sha1Git) {
        self.revision_in_origin.insert((revision, origin.id));
    }

    /// Whether `revision` is already recorded as a head of some origin
    pub fn revision_is_head(&mut self, revision: Sha1Git) -> Result<bool> {
        if self
            .revision_in_origin
            .iter()
            .any(|(rev, _)| *rev == revision)
        {
            return Ok(true);
        }
        let stored = self
            .storage
            .relation_get(RelationKind::RevInOrg, &[revision], false)?;
        Ok(!stored.is_empty())
    }

    pub fn revision_get_preferred_origin(
        &mut self,
        revision: Sha1Git,
    ) -> Result<Option<Sha1Git>> {
        self.fetch_revision_data(&[revision])?;
        Ok(self
            .revision_data
            .get(&revision)
            .and_then(|data| data.origin))
    }

    pub fn revision_set_preferred_origin(&mut self, origin: &OriginEntry, revision: Sha1Git) {
        let entry = self.revision_data.entry(revision).or_default();
        entry.origin = Some(origin.id);
        self.revision_added.insert(revision);
    }

    fn fetch_revision_data(&mut self, ids: &[Sha1Git]) -> Result<()> {
        let missing: Vec<Sha1Git> = ids
            .iter()
            .filter(|id| !self.revision_data.contains_key(*id))
            .copied()
            .collect();
        if !missing.is_empty() {
            let fetched = self.storage.revision_get(&missing)?;
            self.revision_data.extend(fetched);
        }
        Ok(())
    }

    // Origins ------------------------------------------------------------

    pub fn origin_add(&mut self, origin: &OriginEntry) {
        self.origin_urls.insert(origin.id, origin.url.clone());
        self.origin_added.insert(origin.id);
    }

    // Flushing -----------------------------------------------------------

    /// Serialize every buffered mutation to the storage, in an order that
    /// keeps a crashed-then-reingested batch consistent, then clear the
    /// caches
    pub fn flush(&mut self) {
        let content_in_revision = Self::triples_to_relation(&self.content_in_revision);
        self.retry_relation(RelationKind::CntEarlyInRev, &content_in_revision);

        let content_in_directory = Self::triples_to_relation(&self.content_in_directory);
        self.retry_relation(RelationKind::CntInDir, &content_in_directory);

        let directory_in_revision = Self::triples_to_relation(&self.directory_in_revision);
        self.retry_relation(RelationKind::DirInRev, &directory_in_revision);

        // After the relations, dates can be set: the entities they cover
        // will not need to be reprocessed after a crash.
        let content_dates: HashMap<Sha1Git, DateTime<Utc>> = self
            .content_added
            .iter()
            .filter_map(|id| self.content_dates.get(id).map(|date| (*id, *date)))
            .collect();
        self.retry("content dates", |storage| {
            storage.content_set_date(&content_dates)
        });

        let directory_data: HashMap<Sha1Git, DirectoryData> = self
            .directory_added
            .iter()
            .filter_map(|id| {
                self.directory_data
                    .get(id)
                    .filter(|data| data.date.is_some())
                    .map(|data| (*id, *data))
            })
            .collect();
        self.retry("directory dates", |storage| {
            storage.directory_set(&directory_data)
        });

        let revision_dates: HashMap<Sha1Git, RevisionData> = self
            .revision_added
            .iter()
            .filter_map(|id| {
                self.revision_data
                    .get(id)
                    .and_then(|data| data.date)
                    .map(|date| {
                        (
                            *id,
                            RevisionData {
                                date: Some(date),
                                origin: None,
                            },
                        )
                    })
            })
            .collect();
        self.retry("revision dates", |storage| {
            storage.revision_set(&revision_dates)
        });

        // Origin layer. URLs go first so preferred-origin rows can resolve
        // them, then history rows, then heads: a head row in the storage
        // asserts its whole history is already there.
        let origin_urls: HashMap<Sha1Git, String> = self
            .origin_added
            .iter()
            .filter_map(|id| self.origin_urls.get(id).map(|url| (*id, url.clone())))
            .collect();
        self.retry("origin urls", |storage| storage.origin_set(&origin_urls));

        let revision_before_revision: HashMap<Sha1Git, BTreeSet<RelationEdge>> = self
            .revision_before_revision
            .iter()
            .map(|(ancestor, heads)| {
                (
                    *ancestor,
                    heads
                        .iter()
                        .map(|head| RelationEdge {
                            dst: *head,
                            path: None,
                        })
                        .collect(),
                )
            })
            .collect();
        self.retry_relation(RelationKind::RevBeforeRev, &revision_before_revision);

        let revision_in_origin: HashMap<Sha1Git, BTreeSet<RelationEdge>> =
            Self::pairs_to_relation(&self.revision_in_origin);
        self.retry_relation(RelationKind::RevInOrg, &revision_in_origin);

        let preferred_origins: HashMap<Sha1Git, RevisionData> = self
            .revision_added
            .iter()
            .filter_map(|id| {
                self.revision_data
                    .get(id)
                    .and_then(|data| data.origin)
                    .map(|origin| {
                        (
                            *id,
                            RevisionData {
                                date: None,
                                origin: Some(origin),
                            },
                        )
                    })
            })
            .collect();
        self.retry("preferred origins", |storage| {
            storage.revision_set(&preferred_origins)
        });

        self.clear_caches();
    }

    /// Flush when the cache has grown past its element threshold. Returns
    /// whether a flush happened.
    pub fn flush_if_necessary(&mut self) -> bool {
        if self.cache_size() > self.max_cache_elements {
            self.flush();
            true
        } else {
            false
        }
    }

    fn retry<F: FnMut(&mut ProvenanceStorage) -> bool>(&mut self, what: &str, mut op: F) {
        while !op(&mut self.storage) {
            warn!("Unable to write {} to the storage. Retrying...", what);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
        }
    }

    fn retry_relation(
        &mut self,
        kind: RelationKind,
        data: &HashMap<Sha1Git, BTreeSet<RelationEdge>>,
    ) {
        while !self.storage.relation_add(kind, data) {
            warn!(
                "Unable to write {} rows to the storage. Retrying...",
                kind.table()
            );
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
        }
    }

    fn triples_to_relation(
        triples: &BTreeSet<(Sha1Git, Sha1Git, Vec<u8>)>,
    ) -> HashMap<Sha1Git, BTreeSet<RelationEdge>> {
        let mut map: HashMap<Sha1Git, BTreeSet<RelationEdge>> = HashMap::new();
        for (src, dst, path) in triples {
            map.entry(*src).or_default().insert(RelationEdge {
                dst: *dst,
                path: Some(path.clone()),
            });
        }
        map
    }

    fn pairs_to_relation(
        pairs: &BTreeSet<(Sha1Git, Sha1Git)>,
    ) -> HashMap<Sha1Git, BTreeSet<RelationEdge>> {
        let mut map: HashMap<Sha1Git, BTreeSet<RelationEdge>> = HashMap::new();
        for (src, dst) in pairs {
            map.entry(*src).or_default().insert(RelationEdge {
                dst: *dst,
                path: None,
            });
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::DbFlavor;

    fn id(byte: u8) -> Sha1Git {
        Sha1Git([byte; 20])
    }

    fn date(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn provenance() -> Provenance {
        Provenance::new(ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap())
    }

    fn file(byte: u8, name: &[u8]) -> FileEntry {
        FileEntry {
            id: id(byte),
            name: name.to_vec(),
        }
    }

    fn revision(byte: u8, secs: i64) -> RevisionEntry {
        RevisionEntry {
            id: id(byte),
            date: date(secs),
            root: id(200),
        }
    }

    #[test]
    fn test_nothing_written_before_flush() {
        let mut prov = provenance();
        let rev = revision(1, 1000);
        let blob = file(2, b"a");
        prov.content_set_early_date(&blob, date(1000));
        prov.content_add_to_revision(&rev, &blob, b"");

        assert!(prov.storage().content_get(&[id(2)]).unwrap().is_empty());
        prov.flush();
        assert_eq!(
            prov.storage().content_get(&[id(2)]).unwrap()[&id(2)],
            date(1000)
        );
        assert_eq!(prov.cache_size(), 0);
    }

    #[test]
    fn test_flush_writes_relations_and_dates() {
        let mut prov = provenance();
        let rev = revision(1, 1000);
        let blob = file(2, b"a");
        let dir = DirectoryEntry {
            id: id(3),
            name: b"sub".to_vec(),
        };

        prov.revision_add(&rev);
        prov.content_set_early_date(&blob, date(900));
        prov.content_add_to_revision(&rev, &blob, b"");
        prov.directory_set_date_in_isochrone_frontier(&dir, date(900));
        prov.directory_add_to_revision(&rev, &dir, b"sub");
        prov.content_add_to_directory(&dir, &blob, b"");
        prov.flush();

        let storage = prov.storage();
        let cir = storage.relation_get_all(RelationKind::CntEarlyInRev).unwrap();
        assert_eq!(cir[&id(2)].len(), 1);
        let dirs = storage.directory_get(&[id(3)]).unwrap();
        assert_eq!(dirs[&id(3)].date, Some(date(900)));
        assert!(!dirs[&id(3)].flat);
        let revs = storage.revision_get(&[id(1)]).unwrap();
        assert_eq!(revs[&id(1)].date, Some(date(1000)));
    }

    #[test]
    fn test_added_sets_gate_writebacks() {
        let mut prov = provenance();
        let blob = file(2, b"a");
        // A read populates the cache without marking anything as added
        assert!(prov.content_get_early_date(&blob).unwrap().is_none());
        prov.flush();
        assert!(prov.storage().content_get(&[id(2)]).unwrap().is_empty());
    }

    #[test]
    fn test_paths_are_normalized() {
        let mut prov = provenance();
        let rev = revision(1, 1000);
        let blob = file(2, b"a");
        prov.content_add_to_revision(&rev, &blob, b"./sub");
        prov.flush();

        let cir = prov
            .storage()
            .relation_get_all(RelationKind::CntEarlyInRev)
            .unwrap();
        let edge = cir[&id(2)].iter().next().unwrap();
        assert_eq!(edge.path.as_deref(), Some(b"sub/a".as_ref()));
    }

    #[test]
    fn test_origin_layer_flush() {
        let mut prov = provenance();
        let origin = OriginEntry::new("https://example.com/repo".to_string(), id(50));
        prov.origin_add(&origin);
        prov.revision_add_to_origin(&origin, id(1));
        prov.revision_add_before_revision(id(1), id(2));
        prov.revision_set_preferred_origin(&origin, id(1));
        prov.revision_set_preferred_origin(&origin, id(2));
        prov.flush();

        let storage = prov.storage();
        assert_eq!(storage.origin_get(&[origin.id]).unwrap().len(), 1);
        let rio = storage.relation_get_all(RelationKind::RevInOrg).unwrap();
        assert_eq!(rio[&id(1)].iter().next().unwrap().dst, origin.id);
        let rbr = storage.relation_get_all(RelationKind::RevBeforeRev).unwrap();
        assert_eq!(rbr[&id(2)].iter().next().unwrap().dst, id(1));
        let revs = storage.revision_get(&[id(1), id(2)]).unwrap();
        assert_eq!(revs[&id(1)].origin, Some(origin.id));
        assert_eq!(revs[&id(2)].origin, Some(origin.id));
    }

    #[test]
    fn test_preferred_origin_is_cache_first() {
        let mut prov = provenance();
        let origin_a = OriginEntry::new("https://a".to_string(), id(50));
        let origin_b = OriginEntry::new("https://b".to_string(), id(51));

        assert!(prov.revision_get_preferred_origin(id(1)).unwrap().is_none());
        prov.revision_set_preferred_origin(&origin_a, id(1));
        // The unflushed value is already visible
        assert_eq!(
            prov.revision_get_preferred_origin(id(1)).unwrap(),
            Some(origin_a.id)
        );
        prov.origin_add(&origin_a);
        prov.origin_add(&origin_b);
        prov.flush();
        assert_eq!(
            prov.revision_get_preferred_origin(id(1)).unwrap(),
            Some(origin_a.id)
        );
    }

    #[test]
    fn test_flush_if_necessary_threshold() {
        let storage = ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap();
        let mut prov = Provenance::with_cache_limit(storage, 2);
        let rev = revision(1, 1000);
        prov.content_add_to_revision(&rev, &file(2, b"a"), b"");
        assert!(!prov.flush_if_necessary());
        prov.content_add_to_revision(&rev, &file(3, b"b"), b"");
        prov.content_add_to_revision(&rev, &file(4, b"c"), b"");
        assert!(prov.flush_if_necessary());
        assert_eq!(prov.cache_size(), 0);
    }

    #[test]
    fn test_revision_is_head_checks_storage() {
        let mut prov = provenance();
        let origin = OriginEntry::new("https://a".to_string(), id(50));
        assert!(!prov.revision_is_head(id(1)).unwrap());
        prov.origin_add(&origin);
        prov.revision_add_to_origin(&origin, id(1));
        // Visible in cache before flush
        assert!(prov.revision_is_head(id(1)).unwrap());
        prov.flush();
        // And in storage after
        assert!(prov.revision_is_head(id(1)).unwrap());
    }
}
