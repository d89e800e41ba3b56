// src/graph.rs

//! Isochrone-graph construction for one revision
//!
//! The builder runs two passes over the revision's root directory. The
//! first builds the tree of [`IsochroneNode`] with a DFS over the archive,
//! pruned at directories the storage already knows as frontiers, and
//! gathers every known date in bulk. The second computes `maxdate` bottom
//! up, which is purely arithmetic over the in-memory tree.
//!
//! Nodes live in a flat arena owned by the graph; children are indices
//! into it. A child is always allocated after its parent, so walking the
//! arena in reverse index order visits children before parents.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::archive::{Archive, EntryType};
use crate::error::{Error, Result};
use crate::model::{join_path, DirectoryEntry, FileEntry, RevisionEntry, Sha1Git, UTCMIN};
use crate::provenance::Provenance;

/// One directory node of the isochrone graph
#[derive(Debug)]
pub struct IsochroneNode {
    pub entry: DirectoryEntry,
    pub depth: usize,
    dbdate: Option<DateTime<Utc>>,
    pub maxdate: Option<DateTime<Utc>>,
    pub invalid: bool,
    /// Path of this directory relative to the revision root
    pub path: Vec<u8>,
    pub children: Vec<usize>,
    /// File entries directly under this directory
    pub files: Vec<FileEntry>,
}

impl IsochroneNode {
    fn new(entry: DirectoryEntry, dbdate: Option<DateTime<Utc>>, depth: usize, path: Vec<u8>) -> Self {
        Self {
            entry,
            depth,
            dbdate,
            maxdate: None,
            invalid: false,
            path,
            children: Vec::new(),
            files: Vec::new(),
        }
    }

    /// The date this directory already has as a frontier in the storage
    pub fn dbdate(&self) -> Option<DateTime<Utc>> {
        self.dbdate
    }

    /// Drop the stored frontier date: it was set by a later revision and
    /// must not be reused by the one being processed
    fn invalidate(&mut self) {
        self.dbdate = None;
        self.maxdate = None;
        self.invalid = true;
    }
}

/// The isochrone graph of one revision: an arena of nodes rooted at the
/// revision's root directory
#[derive(Debug)]
pub struct IsochroneGraph {
    nodes: Vec<IsochroneNode>,
}

impl IsochroneGraph {
    pub fn root(&self) -> usize {
        0
    }

    pub fn node(&self, index: usize) -> &IsochroneNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether any node in the subtree rooted at `index` holds at least
    /// one file entry
    pub fn has_blobs(&self, index: usize) -> bool {
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            let node = &self.nodes[current];
            if !node.files.is_empty() {
                return true;
            }
            stack.extend(&node.children);
        }
        false
    }
}

/// Build the isochrone graph of `revision`, rooted at `root`.
///
/// `minsize` filters files below the threshold out of directory listings;
/// a non-zero `max_directory_size` bounds the number of directory nodes
/// visited and aborts the revision with [`Error::DirectoryTooLarge`] when
/// exceeded.
pub fn build_isochrone_graph<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    revision: &RevisionEntry,
    root: &DirectoryEntry,
    minsize: u64,
    max_directory_size: usize,
) -> Result<IsochroneGraph> {
    let root_date = provenance.directory_get_date_in_isochrone_frontier(root)?;
    let mut nodes = vec![IsochroneNode::new(
        root.clone(),
        root_date,
        0,
        root.name.clone(),
    )];
    let mut stack = vec![0usize];
    // Earliest known dates of every file seen while building, shared by
    // the whole graph
    let mut fdates: HashMap<Sha1Git, DateTime<Utc>> = HashMap::new();
    let mut counter = 0usize;

    while let Some(current) = stack.pop() {
        counter += 1;
        if max_directory_size > 0 && counter > max_directory_size {
            return Err(Error::DirectoryTooLarge {
                directory: root.id.to_hex(),
                size: counter,
            });
        }

        let dbdate = nodes[current].dbdate;
        let known_frontier = match dbdate {
            // A frontier dated at or after this revision was set by a
            // later revision: the current one is being processed out of
            // order and must not reuse it.
            Some(date) if date >= revision.date => {
                nodes[current].invalidate();
                false
            }
            Some(_) => true,
            None => false,
        };
        if known_frontier {
            continue;
        }

        let entries = archive.directory_ls(nodes[current].entry.id, minsize)?;
        let mut subdirs = Vec::new();
        let mut files = Vec::new();
        for entry in entries {
            match entry.kind {
                EntryType::Dir => subdirs.push(DirectoryEntry {
                    id: entry.target,
                    name: entry.name,
                }),
                EntryType::File => files.push(FileEntry {
                    id: entry.target,
                    name: entry.name,
                }),
                // Submodule pointers lead out of the revision's own tree
                EntryType::Rev => {}
            }
        }

        // One bulk query for all subdirectory dates and one for all file
        // dates of this directory
        let subdir_ids: Vec<Sha1Git> = subdirs.iter().map(|d| d.id).collect();
        let ddates = provenance.directory_get_dates_in_isochrone_frontier(&subdir_ids)?;
        let file_ids: Vec<Sha1Git> = files.iter().map(|f| f.id).collect();
        fdates.extend(provenance.content_get_early_dates(&file_ids)?);

        let depth = nodes[current].depth;
        let parent_path = nodes[current].path.clone();
        nodes[current].files = files;
        for subdir in subdirs {
            let child = nodes.len();
            let path = join_path(&parent_path, &subdir.name);
            let dbdate = ddates.get(&subdir.id).copied();
            nodes.push(IsochroneNode::new(subdir, dbdate, depth + 1, path));
            nodes[current].children.push(child);
            stack.push(child);
        }
    }

    // Children have larger indices than their parents, so a reverse sweep
    // sees every child's maxdate before the parent needs it.
    for index in (0..nodes.len()).rev() {
        if let Some(dbdate) = nodes[index].dbdate {
            nodes[index].maxdate = Some(dbdate);
            continue;
        }
        let mut maxdate = UTCMIN;
        for &child in &nodes[index].children {
            let child_maxdate = nodes[child]
                .maxdate
                .expect("child maxdate computed before parent");
            maxdate = maxdate.max(child_maxdate);
        }
        for file in &nodes[index].files {
            // Unknown files are as recent as the revision introducing them
            maxdate = maxdate.max(fdates.get(&file.id).copied().unwrap_or(revision.date));
        }
        nodes[index].maxdate = Some(maxdate);
    }

    Ok(IsochroneGraph { nodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::db::types::DbFlavor;
    use crate::db::ProvenanceStorage;

    fn id(byte: u8) -> Sha1Git {
        Sha1Git([byte; 20])
    }

    fn date(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn provenance() -> Provenance {
        Provenance::new(ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap())
    }

    fn revision(secs: i64, root: Sha1Git) -> RevisionEntry {
        RevisionEntry {
            id: id(100),
            date: date(secs),
            root,
        }
    }

    /// root (id 1) / sub (id 2) / { b.txt (id 3) }, a.txt (id 4) at root
    fn sample_archive() -> MemoryArchive {
        let mut archive = MemoryArchive::new();
        archive.add_directory(
            id(1),
            vec![
                (b"sub".to_vec(), id(2), EntryType::Dir, 0),
                (b"a.txt".to_vec(), id(4), EntryType::File, 10),
            ],
        );
        archive.add_directory(id(2), vec![(b"b.txt".to_vec(), id(3), EntryType::File, 10)]);
        archive
    }

    #[test]
    fn test_builds_tree_with_paths_and_depths() {
        let mut prov = provenance();
        let archive = sample_archive();
        let rev = revision(1000, id(1));
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            0,
        )
        .unwrap();

        assert_eq!(graph.len(), 2);
        let root = graph.node(graph.root());
        assert_eq!(root.depth, 0);
        assert_eq!(root.path, b"".to_vec());
        assert_eq!(root.files.len(), 1);
        assert_eq!(root.children.len(), 1);

        let sub = graph.node(root.children[0]);
        assert_eq!(sub.depth, 1);
        assert_eq!(sub.path, b"sub".to_vec());
        assert_eq!(sub.files.len(), 1);
    }

    #[test]
    fn test_maxdate_defaults_to_revision_date() {
        let mut prov = provenance();
        let archive = sample_archive();
        let rev = revision(1000, id(1));
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            0,
        )
        .unwrap();

        // No file has a known date: everything is as new as the revision
        assert_eq!(graph.node(graph.root()).maxdate, Some(date(1000)));
        let sub = graph.node(graph.node(graph.root()).children[0]);
        assert_eq!(sub.maxdate, Some(date(1000)));
    }

    #[test]
    fn test_maxdate_uses_known_file_dates() {
        let mut prov = provenance();
        let archive = sample_archive();
        // Both files were first seen at 500
        let blob_a = FileEntry {
            id: id(4),
            name: b"a.txt".to_vec(),
        };
        let blob_b = FileEntry {
            id: id(3),
            name: b"b.txt".to_vec(),
        };
        prov.content_set_early_date(&blob_a, date(500));
        prov.content_set_early_date(&blob_b, date(500));

        let rev = revision(1000, id(1));
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            0,
        )
        .unwrap();

        assert_eq!(graph.node(graph.root()).maxdate, Some(date(500)));
    }

    #[test]
    fn test_known_frontier_is_not_descended() {
        let mut prov = provenance();
        let archive = sample_archive();
        // sub is already a frontier, dated before the revision
        prov.directory_set_date_in_isochrone_frontier(
            &DirectoryEntry {
                id: id(2),
                name: b"sub".to_vec(),
            },
            date(500),
        );

        let rev = revision(1000, id(1));
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            0,
        )
        .unwrap();

        let sub = graph.node(graph.node(graph.root()).children[0]);
        assert_eq!(sub.dbdate(), Some(date(500)));
        assert_eq!(sub.maxdate, Some(date(500)));
        assert!(!sub.invalid);
        // Pruned: its children were never listed
        assert!(sub.files.is_empty());
        assert!(sub.children.is_empty());
    }

    #[test]
    fn test_out_of_order_frontier_is_invalidated() {
        let mut prov = provenance();
        let archive = sample_archive();
        // sub became a frontier through a later revision
        prov.directory_set_date_in_isochrone_frontier(
            &DirectoryEntry {
                id: id(2),
                name: b"sub".to_vec(),
            },
            date(2000),
        );

        let rev = revision(1000, id(1));
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            0,
        )
        .unwrap();

        let sub = graph.node(graph.node(graph.root()).children[0]);
        assert!(sub.invalid);
        assert!(sub.dbdate().is_none());
        // Invalidation forces descending into the directory
        assert_eq!(sub.files.len(), 1);
        assert_eq!(sub.maxdate, Some(date(1000)));
    }

    #[test]
    fn test_max_directory_size_guard() {
        let mut prov = provenance();
        let archive = sample_archive();
        let rev = revision(1000, id(1));
        let result = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            1,
        );
        assert!(matches!(result, Err(Error::DirectoryTooLarge { .. })));

        // A limit the tree fits in does not trigger
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            2,
        )
        .unwrap();
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_has_blobs() {
        let mut prov = provenance();
        let mut archive = MemoryArchive::new();
        // root / wrapper / inner / c.txt
        archive.add_directory(id(1), vec![(b"wrapper".to_vec(), id(2), EntryType::Dir, 0)]);
        archive.add_directory(id(2), vec![(b"inner".to_vec(), id(3), EntryType::Dir, 0)]);
        archive.add_directory(id(3), vec![(b"c.txt".to_vec(), id(4), EntryType::File, 1)]);

        let rev = revision(1000, id(1));
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            0,
        )
        .unwrap();

        let root = graph.root();
        let wrapper = graph.node(root).children[0];
        let inner = graph.node(wrapper).children[0];
        assert!(graph.has_blobs(root));
        assert!(graph.has_blobs(wrapper));
        assert!(graph.has_blobs(inner));

        // An empty-listing directory has no blobs
        let mut empty_archive = MemoryArchive::new();
        empty_archive.add_directory(id(1), vec![]);
        let graph = build_isochrone_graph(
            &mut prov,
            &empty_archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            0,
            0,
        )
        .unwrap();
        assert!(!graph.has_blobs(graph.root()));
    }

    #[test]
    fn test_minsize_filters_files() {
        let mut prov = provenance();
        let archive = sample_archive();
        let rev = revision(1000, id(1));
        let graph = build_isochrone_graph(
            &mut prov,
            &archive,
            &rev,
            &DirectoryEntry::bare(id(1)),
            100,
            0,
        )
        .unwrap();
        // Both files are 10 bytes, filtered out everywhere
        assert!(graph.node(graph.root()).files.is_empty());
    }
}
