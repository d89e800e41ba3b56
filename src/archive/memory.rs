// src/archive/memory.rs

//! In-memory archive backend
//!
//! Holds the DAG in hash maps, either built programmatically (tests) or
//! loaded from a JSON dump (CLI fixtures). Ids in the JSON format are
//! 40-character hex strings.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::archive::{Archive, DirectoryListEntry, EntryType};
use crate::error::{Error, Result};
use crate::model::{RevisionEntry, Sha1Git};

/// Resolution batch size for release and revision lookups
const HEAD_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct RevisionRecord {
    root: Sha1Git,
    date: Option<i64>,
    parents: Vec<Sha1Git>,
}

#[derive(Debug, Clone)]
struct ReleaseRecord {
    target: Sha1Git,
    target_is_revision: bool,
}

#[derive(Debug, Clone)]
struct Branch {
    target: Sha1Git,
    target_kind: BranchTargetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchTargetKind {
    Revision,
    Release,
}

#[derive(Debug, Clone)]
struct EntryRecord {
    name: Vec<u8>,
    target: Sha1Git,
    kind: EntryType,
    length: u64,
}

/// Archive backend holding the whole DAG in memory
#[derive(Debug, Default)]
pub struct MemoryArchive {
    directories: HashMap<Sha1Git, Vec<EntryRecord>>,
    revisions: HashMap<Sha1Git, RevisionRecord>,
    releases: HashMap<Sha1Git, ReleaseRecord>,
    snapshots: HashMap<Sha1Git, Vec<Branch>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directory with `(name, target, kind, length)` entries
    pub fn add_directory(&mut self, id: Sha1Git, entries: Vec<(Vec<u8>, Sha1Git, EntryType, u64)>) {
        let entries = entries
            .into_iter()
            .map(|(name, target, kind, length)| EntryRecord {
                name,
                target,
                kind,
                length,
            })
            .collect();
        self.directories.insert(id, entries);
    }

    pub fn add_revision(
        &mut self,
        id: Sha1Git,
        root: Sha1Git,
        date: Option<i64>,
        parents: Vec<Sha1Git>,
    ) {
        self.revisions.insert(
            id,
            RevisionRecord {
                root,
                date,
                parents,
            },
        );
    }

    pub fn add_release(&mut self, id: Sha1Git, target: Sha1Git, target_is_revision: bool) {
        self.releases.insert(
            id,
            ReleaseRecord {
                target,
                target_is_revision,
            },
        );
    }

    /// Register a snapshot with branches targeting revisions or releases
    pub fn add_snapshot(&mut self, id: Sha1Git, branches: Vec<(Sha1Git, &str)>) {
        let branches = branches
            .into_iter()
            .filter_map(|(target, target_type)| {
                let target_kind = match target_type {
                    "revision" => BranchTargetKind::Revision,
                    "release" => BranchTargetKind::Release,
                    _ => return None,
                };
                Some(Branch {
                    target,
                    target_kind,
                })
            })
            .collect();
        self.snapshots.insert(id, branches);
    }

    /// Load an archive dump from a JSON document (see [`ArchiveDump`])
    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        let dump: ArchiveDump = serde_json::from_reader(reader)
            .map_err(|e| Error::InvalidInput(format!("Failed to parse archive JSON: {}", e)))?;
        dump.into_archive()
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_json(std::io::BufReader::new(file))
    }
}

impl Archive for MemoryArchive {
    fn directory_ls(&self, id: Sha1Git, minsize: u64) -> Result<Vec<DirectoryListEntry>> {
        let entries = match self.directories.get(&id) {
            Some(entries) => entries,
            // Unknown directory: treat as empty, archives have holes
            None => return Ok(Vec::new()),
        };
        Ok(entries
            .iter()
            .filter(|e| e.kind != EntryType::File || minsize == 0 || e.length >= minsize)
            .map(|e| DirectoryListEntry {
                name: e.name.clone(),
                target: e.target,
                kind: e.kind,
            })
            .collect())
    }

    fn revision_get_some_outbound_edges(
        &self,
        id: Sha1Git,
    ) -> Result<Vec<(Sha1Git, Sha1Git)>> {
        let edges = match self.revisions.get(&id) {
            Some(rev) => rev.parents.iter().map(|parent| (id, *parent)).collect(),
            None => Vec::new(),
        };
        Ok(edges)
    }

    fn revisions_get(&self, ids: &[Sha1Git]) -> Result<Vec<RevisionEntry>> {
        let mut result = Vec::new();
        for id in ids {
            if let Some(rev) = self.revisions.get(id) {
                if let Some(secs) = rev.date {
                    let date = DateTime::from_timestamp(secs, 0)
                        .ok_or_else(|| Error::InvalidInput(format!("timestamp {}", secs)))?;
                    result.push(RevisionEntry {
                        id: *id,
                        date,
                        root: rev.root,
                    });
                }
            }
        }
        Ok(result)
    }

    fn snapshot_get_heads(&self, id: Sha1Git) -> Result<Vec<Sha1Git>> {
        let branches = match self.snapshots.get(&id) {
            Some(branches) => branches,
            None => return Ok(Vec::new()),
        };

        let mut targets: BTreeSet<Sha1Git> = BTreeSet::new();
        let mut releases: BTreeSet<Sha1Git> = BTreeSet::new();
        for branch in branches {
            match branch.target_kind {
                BranchTargetKind::Revision => {
                    targets.insert(branch.target);
                }
                BranchTargetKind::Release => {
                    releases.insert(branch.target);
                }
            }
        }

        let releases: Vec<Sha1Git> = releases.into_iter().collect();
        for batch in releases.chunks(HEAD_BATCH_SIZE) {
            for id in batch {
                if let Some(release) = self.releases.get(id) {
                    if release.target_is_revision {
                        targets.insert(release.target);
                    }
                }
            }
        }

        // Only dated revisions qualify as heads
        let targets: Vec<Sha1Git> = targets.into_iter().collect();
        let mut heads = BTreeSet::new();
        for batch in targets.chunks(HEAD_BATCH_SIZE) {
            for entry in self.revisions_get(batch)? {
                heads.insert(entry.id);
            }
        }
        Ok(heads.into_iter().collect())
    }
}

/// Serialized form of an archive dump
///
/// ```json
/// {
///   "directories": [{"id": "…", "entries": [{"name": "a", "target": "…", "type": "file", "length": 3}]}],
///   "revisions": [{"id": "…", "root": "…", "date": 1000000000, "parents": ["…"]}],
///   "releases": [{"id": "…", "target": "…", "target_type": "revision"}],
///   "snapshots": [{"id": "…", "branches": [{"target": "…", "target_type": "revision"}]}]
/// }
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveDump {
    #[serde(default)]
    pub directories: Vec<DirectoryDump>,
    #[serde(default)]
    pub revisions: Vec<RevisionDump>,
    #[serde(default)]
    pub releases: Vec<ReleaseDump>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotDump>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectoryDump {
    pub id: String,
    pub entries: Vec<DirectoryEntryDump>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectoryEntryDump {
    pub name: String,
    pub target: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevisionDump {
    pub id: String,
    pub root: String,
    pub date: Option<i64>,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseDump {
    pub id: String,
    pub target: String,
    pub target_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotDump {
    pub id: String,
    pub branches: Vec<BranchDump>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BranchDump {
    pub target: String,
    pub target_type: String,
}

impl ArchiveDump {
    fn into_archive(self) -> Result<MemoryArchive> {
        let mut archive = MemoryArchive::new();
        for dir in self.directories {
            let id = Sha1Git::from_hex(&dir.id)?;
            let mut entries = Vec::new();
            for entry in dir.entries {
                let kind = entry
                    .entry_type
                    .parse::<EntryType>()
                    .map_err(Error::InvalidInput)?;
                entries.push((
                    entry.name.into_bytes(),
                    Sha1Git::from_hex(&entry.target)?,
                    kind,
                    entry.length,
                ));
            }
            archive.add_directory(id, entries);
        }
        for rev in self.revisions {
            let mut parents = Vec::new();
            for parent in &rev.parents {
                parents.push(Sha1Git::from_hex(parent)?);
            }
            archive.add_revision(
                Sha1Git::from_hex(&rev.id)?,
                Sha1Git::from_hex(&rev.root)?,
                rev.date,
                parents,
            );
        }
        for release in self.releases {
            archive.add_release(
                Sha1Git::from_hex(&release.id)?,
                Sha1Git::from_hex(&release.target)?,
                release.target_type == "revision",
            );
        }
        for snapshot in self.snapshots {
            let id = Sha1Git::from_hex(&snapshot.id)?;
            let mut branches = Vec::new();
            for branch in &snapshot.branches {
                branches.push((
                    Sha1Git::from_hex(&branch.target)?,
                    branch.target_type.as_str(),
                ));
            }
            archive.add_snapshot(id, branches);
        }
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> Sha1Git {
        Sha1Git([byte; 20])
    }

    #[test]
    fn test_directory_ls_filters_by_minsize() {
        let mut archive = MemoryArchive::new();
        archive.add_directory(
            id(1),
            vec![
                (b"small".to_vec(), id(2), EntryType::File, 10),
                (b"large".to_vec(), id(3), EntryType::File, 1000),
                (b"sub".to_vec(), id(4), EntryType::Dir, 0),
            ],
        );

        let all = archive.directory_ls(id(1), 0).unwrap();
        assert_eq!(all.len(), 3);

        let filtered = archive.directory_ls(id(1), 100).unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|e| e.name != b"small".to_vec()));
    }

    #[test]
    fn test_directory_ls_unknown_is_empty() {
        let archive = MemoryArchive::new();
        assert!(archive.directory_ls(id(9), 0).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_heads_resolve_releases() {
        let mut archive = MemoryArchive::new();
        archive.add_revision(id(1), id(10), Some(1000), vec![]);
        archive.add_revision(id(2), id(10), Some(2000), vec![]);
        // Undated revision: not a head
        archive.add_revision(id(3), id(10), None, vec![]);
        archive.add_release(id(4), id(2), true);
        // Release targeting a directory: skipped
        archive.add_release(id(5), id(10), false);
        archive.add_snapshot(
            id(6),
            vec![
                (id(1), "revision"),
                (id(3), "revision"),
                (id(4), "release"),
                (id(5), "release"),
            ],
        );

        let heads = archive.snapshot_get_heads(id(6)).unwrap();
        assert_eq!(heads, vec![id(1), id(2)]);
    }

    #[test]
    fn test_outbound_edges() {
        let mut archive = MemoryArchive::new();
        archive.add_revision(id(1), id(10), Some(1000), vec![id(2), id(3)]);
        let edges = archive.revision_get_some_outbound_edges(id(1)).unwrap();
        assert_eq!(edges, vec![(id(1), id(2)), (id(1), id(3))]);
        assert!(archive
            .revision_get_some_outbound_edges(id(9))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_from_json() {
        let doc = r#"{
            "directories": [
                {"id": "0101010101010101010101010101010101010101",
                 "entries": [{"name": "a", "target": "0202020202020202020202020202020202020202", "type": "file", "length": 3}]}
            ],
            "revisions": [
                {"id": "0303030303030303030303030303030303030303",
                 "root": "0101010101010101010101010101010101010101",
                 "date": 1000000000, "parents": []}
            ]
        }"#;
        let archive = MemoryArchive::from_json(doc.as_bytes()).unwrap();
        let listing = archive.directory_ls(id(1), 0).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, b"a".to_vec());
        let revs = archive.revisions_get(&[id(3)]).unwrap();
        assert_eq!(revs.len(), 1);
        assert_eq!(revs[0].root, id(1));
    }
}
