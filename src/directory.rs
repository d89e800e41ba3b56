// src/directory.rs

//! Directory flattening
//!
//! A frontier directory is "flat" once every blob reachable from it is
//! recorded with its relative path. Flattening happens inline during
//! revision ingestion, or later through [`directory_flatten_range`] when
//! ingestion ran with flattening deferred. Flattening is idempotent and a
//! directory is never un-flattened.

use tracing::debug;

use crate::archive::{Archive, EntryType};
use crate::error::Result;
use crate::model::{join_path, DirectoryEntry, FileEntry, Sha1Git};
use crate::provenance::Provenance;

/// Page size used when scanning unflattened directories
const FLATTEN_PAGE_SIZE: usize = 100;

/// Record every blob reachable from `directory` with its relative path,
/// then mark the directory flat
pub fn directory_flatten<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    directory: &DirectoryEntry,
    minsize: u64,
) -> Result<()> {
    let mut stack: Vec<(Sha1Git, Vec<u8>)> = vec![(directory.id, Vec::new())];
    while let Some((current, prefix)) = stack.pop() {
        for entry in archive.directory_ls(current, minsize)? {
            match entry.kind {
                EntryType::File => {
                    let blob = FileEntry {
                        id: entry.target,
                        name: entry.name,
                    };
                    provenance.content_add_to_directory(directory, &blob, &prefix);
                }
                EntryType::Dir => {
                    stack.push((entry.target, join_path(&prefix, &entry.name)));
                }
                EntryType::Rev => {}
            }
        }
    }
    provenance.directory_flag_as_flattened(directory)?;
    Ok(())
}

/// Flatten the given directories, skipping the ones unknown to the model
/// or already flat, and flush
pub fn directory_add<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    directories: &[DirectoryEntry],
    minsize: u64,
    commit: bool,
) -> Result<()> {
    for directory in directories {
        match provenance.directory_already_flattened(directory)? {
            Some(false) => directory_flatten(provenance, archive, directory, minsize)?,
            Some(true) => debug!("directory {} already flattened", directory.id),
            None => debug!("directory {} not in the provenance model", directory.id),
        }
    }
    if commit {
        provenance.flush();
    }
    Ok(())
}

/// Flatten the known, unflattened directories with ids in
/// `[start_id, end_id)`, paging through the storage
pub fn directory_flatten_range<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    start_id: Sha1Git,
    end_id: Sha1Git,
    minsize: u64,
) -> Result<()> {
    let mut current = start_id;
    while current < end_id {
        let ids = provenance
            .storage()
            .directory_iter_not_flattened(FLATTEN_PAGE_SIZE, current)?;
        if ids.is_empty() {
            break;
        }
        let last = ids[ids.len() - 1];
        let directories: Vec<DirectoryEntry> = ids
            .into_iter()
            .filter(|id| *id < end_id)
            .map(DirectoryEntry::bare)
            .collect();
        directory_add(provenance, archive, &directories, minsize, true)?;
        current = last;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::db::types::{DbFlavor, RelationKind};
    use crate::db::ProvenanceStorage;
    use chrono::DateTime;

    fn id(byte: u8) -> Sha1Git {
        Sha1Git([byte; 20])
    }

    fn provenance() -> Provenance {
        Provenance::new(ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap())
    }

    fn seeded_directory(prov: &mut Provenance, dir: Sha1Git) {
        prov.directory_set_date_in_isochrone_frontier(
            &DirectoryEntry::bare(dir),
            DateTime::from_timestamp(1000, 0).unwrap(),
        );
    }

    /// D1 (id 1) contains a (id 2), b (id 3) and c/ (id 4) with d (id 5)
    fn sample_archive() -> MemoryArchive {
        let mut archive = MemoryArchive::new();
        archive.add_directory(
            id(1),
            vec![
                (b"a".to_vec(), id(2), EntryType::File, 1),
                (b"b".to_vec(), id(3), EntryType::File, 1),
                (b"c".to_vec(), id(4), EntryType::Dir, 0),
            ],
        );
        archive.add_directory(id(4), vec![(b"d".to_vec(), id(5), EntryType::File, 1)]);
        archive
    }

    #[test]
    fn test_flatten_records_every_blob() {
        let mut prov = provenance();
        let archive = sample_archive();
        seeded_directory(&mut prov, id(1));

        directory_flatten(&mut prov, &archive, &DirectoryEntry::bare(id(1)), 0).unwrap();
        prov.flush();

        let edges = prov
            .storage()
            .relation_get_all(RelationKind::CntInDir)
            .unwrap();
        let paths: Vec<(Sha1Git, Vec<u8>)> = edges
            .iter()
            .flat_map(|(src, set)| {
                set.iter()
                    .map(move |e| (*src, e.path.clone().unwrap_or_default()))
            })
            .collect();
        assert_eq!(paths.len(), 3);
        assert!(paths.contains(&(id(2), b"a".to_vec())));
        assert!(paths.contains(&(id(3), b"b".to_vec())));
        assert!(paths.contains(&(id(5), b"c/d".to_vec())));

        let flat = prov
            .directory_already_flattened(&DirectoryEntry::bare(id(1)))
            .unwrap();
        assert_eq!(flat, Some(true));
    }

    #[test]
    fn test_flatten_is_idempotent() {
        let mut prov = provenance();
        let archive = sample_archive();
        seeded_directory(&mut prov, id(1));

        directory_add(&mut prov, &archive, &[DirectoryEntry::bare(id(1))], 0, true).unwrap();
        let first = prov
            .storage()
            .relation_get_all(RelationKind::CntInDir)
            .unwrap();

        directory_add(&mut prov, &archive, &[DirectoryEntry::bare(id(1))], 0, true).unwrap();
        let second = prov
            .storage()
            .relation_get_all(RelationKind::CntInDir)
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_add_skips_unknown_directories() {
        let mut prov = provenance();
        let archive = sample_archive();

        // id(1) was never recorded as a frontier
        directory_add(&mut prov, &archive, &[DirectoryEntry::bare(id(1))], 0, true).unwrap();
        assert!(prov
            .storage()
            .relation_get_all(RelationKind::CntInDir)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_flatten_range_pages_through_directories() {
        let mut prov = provenance();
        let mut archive = MemoryArchive::new();
        for byte in 1..=3u8 {
            archive.add_directory(
                id(byte),
                vec![(vec![b'f', byte], id(100 + byte), EntryType::File, 1)],
            );
            seeded_directory(&mut prov, id(byte));
        }
        prov.flush();

        directory_flatten_range(&mut prov, &archive, Sha1Git([0; 20]), Sha1Git([0xff; 20]), 0)
            .unwrap();

        for byte in 1..=3u8 {
            assert_eq!(
                prov.directory_already_flattened(&DirectoryEntry::bare(id(byte)))
                    .unwrap(),
                Some(true),
                "directory {} should be flat",
                byte
            );
        }
    }

    #[test]
    fn test_flatten_range_respects_end_bound() {
        let mut prov = provenance();
        let mut archive = MemoryArchive::new();
        for byte in 1..=3u8 {
            archive.add_directory(
                id(byte),
                vec![(vec![b'f', byte], id(100 + byte), EntryType::File, 1)],
            );
            seeded_directory(&mut prov, id(byte));
        }
        prov.flush();

        // End bound excludes id(3)
        directory_flatten_range(&mut prov, &archive, Sha1Git([0; 20]), id(3), 0).unwrap();

        assert_eq!(
            prov.directory_already_flattened(&DirectoryEntry::bare(id(2)))
                .unwrap(),
            Some(true)
        );
        assert_eq!(
            prov.directory_already_flattened(&DirectoryEntry::bare(id(3)))
                .unwrap(),
            Some(false)
        );
    }
}
