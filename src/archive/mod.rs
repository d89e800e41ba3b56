// src/archive/mod.rs

//! Read-only access to the archive's Merkle DAG
//!
//! The index never stores file contents or validates hashes; it only walks
//! the DAG through this narrow interface. Production deployments back it
//! with a database or a remote service, tests and CLI fixtures with
//! [`MemoryArchive`], and mixed deployments chain several backends behind
//! [`Multiplexer`].

pub mod memory;
pub mod multiplexer;

pub use memory::MemoryArchive;
pub use multiplexer::Multiplexer;

use crate::error::Result;
use crate::model::{RevisionEntry, Sha1Git};

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
    Rev,
}

impl EntryType {
    pub fn as_str(&self) -> &str {
        match self {
            EntryType::File => "file",
            EntryType::Dir => "dir",
            EntryType::Rev => "rev",
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(EntryType::File),
            "dir" => Ok(EntryType::Dir),
            "rev" => Ok(EntryType::Rev),
            _ => Err(format!("Invalid entry type: {}", s)),
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryListEntry {
    pub name: Vec<u8>,
    pub target: Sha1Git,
    pub kind: EntryType,
}

/// Capability interface over the archive, consumed by the ingestion
/// pipeline and the origin layer.
pub trait Archive {
    /// List one directory. Files smaller than `minsize` bytes are filtered
    /// out when `minsize` is non-zero. An unknown id yields an empty
    /// listing, not an error: archives evolve and holes are expected.
    fn directory_ls(&self, id: Sha1Git, minsize: u64) -> Result<Vec<DirectoryListEntry>>;

    /// List some `(revision, parent)` edges reachable from `id`. The result
    /// may cover several revisions, but whenever any edge of a revision is
    /// present, all edges of that revision are.
    fn revision_get_some_outbound_edges(&self, id: Sha1Git)
        -> Result<Vec<(Sha1Git, Sha1Git)>>;

    /// Resolve revision ids to `(id, date, root)` entries, skipping unknown
    /// or undated revisions.
    fn revisions_get(&self, ids: &[Sha1Git]) -> Result<Vec<RevisionEntry>>;

    /// All head revisions of one snapshot: targets of its branches,
    /// resolving release branches to their revision target.
    fn snapshot_get_heads(&self, id: Sha1Git) -> Result<Vec<Sha1Git>>;
}
