// src/revision.rs

//! Revision ingestion
//!
//! For each revision, builds its isochrone graph and walks it from the
//! root, classifying every directory node:
//!
//! - a directory the storage already knows as a frontier is linked to the
//!   revision and the walk stops there,
//! - a directory promoted to a new frontier gets its maxdate recorded,
//!   is linked to the revision and (optionally) flattened,
//! - anything above the frontier has its files linked directly to the
//!   revision, and the walk descends into its subdirectories.

use std::io::BufRead;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::directory::directory_flatten;
use crate::error::{Error, Result};
use crate::graph::{build_isochrone_graph, IsochroneGraph};
use crate::model::{DirectoryEntry, RevisionEntry, Sha1Git};
use crate::provenance::Provenance;

/// Knobs of the revision-content algorithm
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Record directory-to-revision links for reused and new frontiers.
    /// When false only the blob layer is tracked.
    pub trackall: bool,
    /// Flatten new frontiers inline. When false the flat models are left
    /// to a later directory-flatten pass.
    pub flatten: bool,
    /// Require at least one blob under a directory before promoting it to
    /// a frontier, pushing frontiers lower in the tree
    pub lower: bool,
    /// Minimum depth (from the revision root) of a new frontier
    pub mindepth: usize,
    /// Skip files smaller than this many bytes
    pub minsize: u64,
    /// Abort a revision whose root subtree has more than this many
    /// directories (0 disables the guard)
    pub max_directory_size: usize,
    /// Flush the cache once the batch is processed
    pub commit: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            trackall: true,
            flatten: true,
            lower: true,
            mindepth: 1,
            minsize: 0,
            max_directory_size: 0,
            commit: true,
        }
    }
}

/// Ingest a batch of revisions.
///
/// Revisions already known with an earlier-or-equal date are skipped. A
/// revision tripping the directory-size guard is dropped (its buffered
/// mutations with it) and reported after the rest of the batch went
/// through; storage errors abort the batch.
pub fn revision_add<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    revisions: &[RevisionEntry],
    options: &IngestOptions,
) -> Result<()> {
    let mut failed: Option<Error> = None;
    for revision in revisions {
        debug!("Processing revision {} ({})", revision.id, revision.date);
        match ingest_one(provenance, archive, revision, options) {
            Ok(()) => {}
            Err(err @ Error::DirectoryTooLarge { .. }) => {
                warn!("Skipping revision {}: {}", revision.id, err);
                provenance.clear_caches();
                failed = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    if options.commit {
        provenance.flush();
    }
    match failed {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn ingest_one<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    revision: &RevisionEntry,
    options: &IngestOptions,
) -> Result<()> {
    let known_date = provenance.revision_get_date(revision)?;
    if let Some(known) = known_date {
        if revision.date >= known {
            debug!("Revision {} already processed", revision.id);
            return Ok(());
        }
    }
    provenance.revision_add(revision);

    let root = DirectoryEntry::bare(revision.root);
    let graph = build_isochrone_graph(
        provenance,
        archive,
        revision,
        &root,
        options.minsize,
        options.max_directory_size,
    )?;
    process_content(provenance, archive, revision, &graph, options)
}

fn process_content<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    revision: &RevisionEntry,
    graph: &IsochroneGraph,
    options: &IngestOptions,
) -> Result<()> {
    let mut stack = vec![graph.root()];
    while let Some(current) = stack.pop() {
        let node = graph.node(current);
        if node.dbdate().is_some() {
            // A frontier from a previously processed revision, reused as is
            if options.trackall {
                provenance.directory_add_to_revision(revision, &node.entry, &node.path);
            }
        } else if is_new_frontier(graph, current, revision, options) {
            let maxdate = node
                .maxdate
                .expect("maxdate set by the second builder pass");
            provenance.directory_set_date_in_isochrone_frontier(&node.entry, maxdate);
            if options.trackall {
                provenance.directory_add_to_revision(revision, &node.entry, &node.path);
                if options.flatten {
                    directory_flatten(provenance, archive, &node.entry, options.minsize)?;
                }
            }
        } else {
            // Above the frontier: link the files directly to the revision
            // and keep descending
            for blob in &node.files {
                let known = provenance.content_get_early_date(blob)?;
                if known.map_or(true, |date| revision.date < date) {
                    provenance.content_set_early_date(blob, revision.date);
                }
                provenance.content_add_to_revision(revision, blob, &node.path);
            }
            stack.extend(&node.children);
        }
    }
    Ok(())
}

/// Whether the directory node qualifies as a new frontier for `revision`.
///
/// The date comparison is strict: a directory whose newest artifact is as
/// recent as the revision is not a frontier. With `lower`, a candidate
/// also needs a blob somewhere below it, so the walk keeps descending past
/// blob-less wrapper directories.
fn is_new_frontier(
    graph: &IsochroneGraph,
    index: usize,
    revision: &RevisionEntry,
    options: &IngestOptions,
) -> bool {
    let node = graph.node(index);
    let maxdate = node
        .maxdate
        .expect("maxdate set by the second builder pass");
    maxdate < revision.date
        && node.depth >= options.mindepth
        && (!options.lower || graph.has_blobs(index))
}

/// Parse `revision-hex,iso8601-date,root-hex` rows. Rows that do not
/// parse are skipped and counted.
pub fn revisions_from_csv<R: BufRead>(reader: R) -> Result<Vec<RevisionEntry>> {
    let mut revisions = Vec::new();
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_revision_row(line) {
            Ok(revision) => revisions.push(revision),
            Err(err) => {
                warn!("Skipping revision row {:?}: {}", line, err);
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        info!("Skipped {} malformed revision rows", skipped);
    }
    Ok(revisions)
}

fn parse_revision_row(line: &str) -> Result<RevisionEntry> {
    let mut fields = line.split(',');
    let (id, date, root) = match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(id), Some(date), Some(root), None) => (id, date, root),
        _ => {
            return Err(Error::InvalidInput(format!(
                "expected 3 comma-separated fields: {}",
                line
            )))
        }
    };
    let date = DateTime::parse_from_rfc3339(date.trim())
        .map_err(|e| Error::InvalidInput(format!("bad date {:?}: {}", date, e)))?
        .with_timezone(&Utc);
    Ok(RevisionEntry {
        id: Sha1Git::from_hex(id)?,
        date,
        root: Sha1Git::from_hex(root)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{EntryType, MemoryArchive};
    use crate::db::types::{DbFlavor, RelationKind};
    use crate::db::ProvenanceStorage;
    use chrono::{DateTime, Utc};

    fn id(byte: u8) -> Sha1Git {
        Sha1Git([byte; 20])
    }

    fn date(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn provenance() -> Provenance {
        Provenance::new(ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap())
    }

    fn revision(byte: u8, secs: i64, root: Sha1Git) -> RevisionEntry {
        RevisionEntry {
            id: id(byte),
            date: date(secs),
            root,
        }
    }

    /// Root D1 (id 10) with file A (id 20); used by the direct-occurrence
    /// scenario
    fn flat_archive() -> MemoryArchive {
        let mut archive = MemoryArchive::new();
        archive.add_directory(id(10), vec![(b"A".to_vec(), id(20), EntryType::File, 1)]);
        archive
    }

    /// Root D1 (id 10) containing D2 (id 11) containing file B (id 21)
    fn nested_archive() -> MemoryArchive {
        let mut archive = MemoryArchive::new();
        archive.add_directory(id(10), vec![(b"D2".to_vec(), id(11), EntryType::Dir, 0)]);
        archive.add_directory(id(11), vec![(b"B".to_vec(), id(21), EntryType::File, 1)]);
        archive
    }

    #[test]
    fn test_simple_direct_occurrence() {
        let mut prov = provenance();
        let archive = flat_archive();
        let rev = revision(1, 1_000_000_000, id(10));

        revision_add(&mut prov, &archive, &[rev], &IngestOptions::default()).unwrap();

        let first = prov.content_find_first(id(20)).unwrap().unwrap();
        assert_eq!(first.content, id(20));
        assert_eq!(first.revision, id(1));
        assert_eq!(first.date, date(1_000_000_000));
        assert_eq!(first.origin, None);
        assert_eq!(first.path, b"A".to_vec());
    }

    #[test]
    fn test_frontier_promotion_on_second_revision() {
        let mut prov = provenance();
        let archive = nested_archive();
        let r1 = revision(1, 1000, id(10));
        let r2 = revision(2, 2000, id(10));

        revision_add(&mut prov, &archive, &[r1], &IngestOptions::default()).unwrap();
        revision_add(&mut prov, &archive, &[r2], &IngestOptions::default()).unwrap();

        let storage = prov.storage();
        // D2 was promoted when R2 saw all its content as older
        let dir = storage.relation_get_all(RelationKind::DirInRev).unwrap();
        let d2_edges = &dir[&id(11)];
        assert_eq!(d2_edges.len(), 1);
        let edge = d2_edges.iter().next().unwrap();
        assert_eq!(edge.dst, id(2));
        assert_eq!(edge.path.as_deref(), Some(b"D2".as_ref()));

        let cid = storage.relation_get_all(RelationKind::CntInDir).unwrap();
        let b_edge = cid[&id(21)].iter().next().unwrap();
        assert_eq!(b_edge.dst, id(11));
        assert_eq!(b_edge.path.as_deref(), Some(b"B".as_ref()));

        // No direct B-in-R2 edge: B is behind the frontier there
        let cir = storage.relation_get_all(RelationKind::CntEarlyInRev).unwrap();
        assert!(cir[&id(21)].iter().all(|e| e.dst != id(2)));

        let first = prov.content_find_first(id(21)).unwrap().unwrap();
        assert_eq!(first.revision, id(1));
        assert_eq!(first.date, date(1000));
        assert_eq!(first.path, b"D2/B".to_vec());
    }

    #[test]
    fn test_out_of_order_ingestion_invalidates_frontier() {
        let mut prov = provenance();
        let archive = nested_archive();
        let r1 = revision(1, 1000, id(10));
        let r2 = revision(2, 2000, id(10));

        // Newest first: D2 becomes a frontier dated 2000... no, first R2
        // links B directly (nothing older known), then R1 arrives dated
        // before the frontier R2 might have set
        revision_add(&mut prov, &archive, &[r2.clone()], &IngestOptions::default()).unwrap();
        revision_add(&mut prov, &archive, &[r1], &IngestOptions::default()).unwrap();

        let cir = prov
            .storage()
            .relation_get_all(RelationKind::CntEarlyInRev)
            .unwrap();
        assert!(cir[&id(21)]
            .iter()
            .any(|e| e.dst == id(1) && e.path.as_deref() == Some(b"D2/B".as_ref())));

        let first = prov.content_find_first(id(21)).unwrap().unwrap();
        assert_eq!(first.revision, id(1));
        assert_eq!(first.date, date(1000));
    }

    #[test]
    fn test_reingestion_is_a_noop() {
        let mut prov = provenance();
        let archive = nested_archive();
        let r1 = revision(1, 1000, id(10));
        let r2 = revision(2, 2000, id(10));

        revision_add(&mut prov, &archive, &[r1.clone()], &IngestOptions::default()).unwrap();
        revision_add(&mut prov, &archive, &[r2.clone()], &IngestOptions::default()).unwrap();

        let cir_before = prov
            .storage()
            .relation_get_all(RelationKind::CntEarlyInRev)
            .unwrap();
        let dir_before = prov
            .storage()
            .relation_get_all(RelationKind::DirInRev)
            .unwrap();
        let dates_before = prov.storage().content_get(&[id(21)]).unwrap();

        revision_add(&mut prov, &archive, &[r1, r2], &IngestOptions::default()).unwrap();

        assert_eq!(
            cir_before,
            prov.storage()
                .relation_get_all(RelationKind::CntEarlyInRev)
                .unwrap()
        );
        assert_eq!(
            dir_before,
            prov.storage().relation_get_all(RelationKind::DirInRev).unwrap()
        );
        assert_eq!(dates_before, prov.storage().content_get(&[id(21)]).unwrap());
    }

    #[test]
    fn test_mindepth_keeps_root_out_of_frontier() {
        let mut prov = provenance();
        let archive = nested_archive();
        let r1 = revision(1, 1000, id(10));
        let r2 = revision(2, 2000, id(10));
        let options = IngestOptions {
            mindepth: 2,
            ..IngestOptions::default()
        };

        revision_add(&mut prov, &archive, &[r1], &options).unwrap();
        revision_add(&mut prov, &archive, &[r2], &options).unwrap();

        // D2 sits at depth 1 < mindepth: B stays directly linked to both
        let cir = prov
            .storage()
            .relation_get_all(RelationKind::CntEarlyInRev)
            .unwrap();
        assert_eq!(cir[&id(21)].len(), 2);
        assert!(prov
            .storage()
            .relation_get_all(RelationKind::DirInRev)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_flatten_false_defers_flat_model() {
        let mut prov = provenance();
        let archive = nested_archive();
        let r1 = revision(1, 1000, id(10));
        let r2 = revision(2, 2000, id(10));
        let options = IngestOptions {
            flatten: false,
            ..IngestOptions::default()
        };

        revision_add(&mut prov, &archive, &[r1], &options).unwrap();
        revision_add(&mut prov, &archive, &[r2], &options).unwrap();

        // The frontier is recorded but its flat model is deferred
        assert!(!prov
            .storage()
            .relation_get_all(RelationKind::DirInRev)
            .unwrap()
            .is_empty());
        assert!(prov
            .storage()
            .relation_get_all(RelationKind::CntInDir)
            .unwrap()
            .is_empty());
        assert_eq!(
            prov.directory_already_flattened(&DirectoryEntry::bare(id(11)))
                .unwrap(),
            Some(false)
        );
        assert_eq!(
            prov.storage().directory_iter_not_flattened(10, Sha1Git([0; 20])).unwrap(),
            vec![id(11)]
        );
    }

    #[test]
    fn test_trackall_false_only_tracks_blobs() {
        let mut prov = provenance();
        let archive = nested_archive();
        let r1 = revision(1, 1000, id(10));
        let r2 = revision(2, 2000, id(10));
        let options = IngestOptions {
            trackall: false,
            ..IngestOptions::default()
        };

        revision_add(&mut prov, &archive, &[r1], &options).unwrap();
        revision_add(&mut prov, &archive, &[r2], &options).unwrap();

        assert!(prov
            .storage()
            .relation_get_all(RelationKind::DirInRev)
            .unwrap()
            .is_empty());
        assert!(prov
            .storage()
            .relation_get_all(RelationKind::CntInDir)
            .unwrap()
            .is_empty());
        // The frontier date is still recorded for later revisions
        assert!(prov
            .directory_get_date_in_isochrone_frontier(&DirectoryEntry::bare(id(11)))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_directory_too_large_leaves_storage_unchanged() {
        let mut prov = provenance();
        let archive = nested_archive();
        let rev = revision(1, 1000, id(10));
        let options = IngestOptions {
            max_directory_size: 1,
            ..IngestOptions::default()
        };

        let result = revision_add(&mut prov, &archive, &[rev], &options);
        assert!(matches!(result, Err(Error::DirectoryTooLarge { .. })));

        let storage = prov.storage();
        assert!(storage.revision_get(&[id(1)]).unwrap().is_empty());
        assert!(storage
            .relation_get_all(RelationKind::CntEarlyInRev)
            .unwrap()
            .is_empty());
        assert!(storage.content_get(&[id(21)]).unwrap().is_empty());
    }

    #[test]
    fn test_lower_requires_a_reachable_blob() {
        // Root (id 10) / empty (id 11, a directory holding no file at all)
        let mut archive = MemoryArchive::new();
        archive.add_directory(id(10), vec![(b"empty".to_vec(), id(11), EntryType::Dir, 0)]);
        archive.add_directory(id(11), vec![]);
        let rev = revision(1, 1000, id(10));

        // With lower, a blob-free directory is never promoted: there is
        // nothing to de-duplicate behind it
        let mut prov = provenance();
        revision_add(&mut prov, &archive, &[rev.clone()], &IngestOptions::default()).unwrap();
        assert!(prov
            .storage()
            .relation_get_all(RelationKind::DirInRev)
            .unwrap()
            .is_empty());

        // Without it, the date check alone decides
        let mut prov = provenance();
        let options = IngestOptions {
            lower: false,
            ..IngestOptions::default()
        };
        revision_add(&mut prov, &archive, &[rev], &options).unwrap();
        let dir = prov.storage().relation_get_all(RelationKind::DirInRev).unwrap();
        assert!(dir.contains_key(&id(11)));
    }

    #[test]
    fn test_csv_parsing_skips_bad_rows() {
        let csv = "\
0101010101010101010101010101010101010101,2009-02-13T23:31:30+00:00,0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a
not-a-row
0202020202020202020202020202020202020202,not-a-date,0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a

0303030303030303030303030303030303030303,2009-02-13T23:31:31Z,0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a
";
        let revisions = revisions_from_csv(csv.as_bytes()).unwrap();
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].id, id(1));
        assert_eq!(revisions[0].date, date(1_234_567_890));
        assert_eq!(revisions[1].id, id(3));
        assert_eq!(revisions[1].date, date(1_234_567_891));
    }
}
