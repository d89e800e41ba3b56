// src/db/types.rs

//! Value types of the provenance storage model

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::model::Sha1Git;

/// Backend-wide storage flavor, chosen at database creation
///
/// Two orthogonal dimensions: whether the blob/directory relations carry a
/// path, and whether relation rows are normalized (one row per edge) or
/// denormalized (per-source arrays of destinations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbFlavor {
    WithPath,
    WithoutPath,
    WithPathDenormalized,
    WithoutPathDenormalized,
}

impl DbFlavor {
    pub fn as_str(&self) -> &str {
        match self {
            DbFlavor::WithPath => "with-path",
            DbFlavor::WithoutPath => "without-path",
            DbFlavor::WithPathDenormalized => "with-path-denormalized",
            DbFlavor::WithoutPathDenormalized => "without-path-denormalized",
        }
    }

    pub fn with_path(&self) -> bool {
        matches!(self, DbFlavor::WithPath | DbFlavor::WithPathDenormalized)
    }

    pub fn denormalized(&self) -> bool {
        matches!(
            self,
            DbFlavor::WithPathDenormalized | DbFlavor::WithoutPathDenormalized
        )
    }
}

impl FromStr for DbFlavor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "with-path" => Ok(DbFlavor::WithPath),
            "without-path" => Ok(DbFlavor::WithoutPath),
            "with-path-denormalized" => Ok(DbFlavor::WithPathDenormalized),
            "without-path-denormalized" => Ok(DbFlavor::WithoutPathDenormalized),
            _ => Err(format!("Invalid database flavor: {}", s)),
        }
    }
}

/// Entity tables of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Content,
    Directory,
    Revision,
    Origin,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Content => "content",
            EntityKind::Directory => "directory",
            EntityKind::Revision => "revision",
            EntityKind::Origin => "origin",
        }
    }
}

/// The five relation kinds of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    CntEarlyInRev,
    CntInDir,
    DirInRev,
    RevInOrg,
    RevBeforeRev,
}

impl RelationKind {
    pub const ALL: [RelationKind; 5] = [
        RelationKind::CntEarlyInRev,
        RelationKind::CntInDir,
        RelationKind::DirInRev,
        RelationKind::RevInOrg,
        RelationKind::RevBeforeRev,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            RelationKind::CntEarlyInRev => "content_in_revision",
            RelationKind::CntInDir => "content_in_directory",
            RelationKind::DirInRev => "directory_in_revision",
            RelationKind::RevInOrg => "revision_in_origin",
            RelationKind::RevBeforeRev => "revision_before_revision",
        }
    }

    pub fn src(&self) -> EntityKind {
        match self {
            RelationKind::CntEarlyInRev | RelationKind::CntInDir => EntityKind::Content,
            RelationKind::DirInRev => EntityKind::Directory,
            RelationKind::RevInOrg | RelationKind::RevBeforeRev => EntityKind::Revision,
        }
    }

    pub fn dst(&self) -> EntityKind {
        match self {
            RelationKind::CntEarlyInRev | RelationKind::DirInRev => EntityKind::Revision,
            RelationKind::CntInDir => EntityKind::Directory,
            RelationKind::RevInOrg => EntityKind::Origin,
            RelationKind::RevBeforeRev => EntityKind::Revision,
        }
    }

    pub fn src_column(&self) -> &'static str {
        match self {
            RelationKind::CntEarlyInRev | RelationKind::CntInDir => "content",
            RelationKind::DirInRev => "directory",
            RelationKind::RevInOrg => "revision",
            RelationKind::RevBeforeRev => "prev",
        }
    }

    pub fn dst_column(&self) -> &'static str {
        match self {
            RelationKind::CntEarlyInRev | RelationKind::DirInRev => "revision",
            RelationKind::CntInDir => "directory",
            RelationKind::RevInOrg => "origin",
            RelationKind::RevBeforeRev => "next",
        }
    }

    /// Whether edges of this relation carry a path
    pub fn uses_location(&self) -> bool {
        matches!(
            self,
            RelationKind::CntEarlyInRev | RelationKind::CntInDir | RelationKind::DirInRev
        )
    }
}

impl FromStr for RelationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "content_in_revision" => Ok(RelationKind::CntEarlyInRev),
            "content_in_directory" => Ok(RelationKind::CntInDir),
            "directory_in_revision" => Ok(RelationKind::DirInRev),
            "revision_in_origin" => Ok(RelationKind::RevInOrg),
            "revision_before_revision" => Ok(RelationKind::RevBeforeRev),
            _ => Err(format!("Invalid relation kind: {}", s)),
        }
    }
}

/// Data associated to a directory: its date in the isochrone frontier and
/// whether its flat model (all reachable blobs) has been materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryData {
    pub date: Option<DateTime<Utc>>,
    pub flat: bool,
}

/// Data associated to a revision: its author date (set once processed by
/// the revision layer) and its preferred origin, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RevisionData {
    pub date: Option<DateTime<Utc>>,
    pub origin: Option<Sha1Git>,
}

/// One edge of a relation as seen from its source entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationEdge {
    pub dst: Sha1Git,
    pub path: Option<Vec<u8>>,
}

/// One occurrence of a blob, as returned by the find queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceResult {
    pub content: Sha1Git,
    pub revision: Sha1Git,
    pub date: DateTime<Utc>,
    pub origin: Option<String>,
    pub path: Vec<u8>,
}
