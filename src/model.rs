// src/model.rs

//! Core identifier and entry types shared across the crate
//!
//! Every node of the archive's Merkle DAG is addressed by a 20-byte hash
//! ([`Sha1Git`]). Paths inside directories are byte strings with `/` as the
//! separator; helpers here implement the joining and normalization rules
//! used by the path-carrying relations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Earliest representable date, used as the identity for `max` folds
pub const UTCMIN: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// A 20-byte object identifier (sha1 over the object's canonical form)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1Git(pub [u8; 20]);

impl Sha1Git {
    /// Parse a 40-character hex string into an id
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidId(hex.to_string()));
        }
        let mut bytes = [0u8; 20];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::InvalidId(hex.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Derive an origin id from its URL (sha1 over the URL bytes)
    pub fn from_url(url: &str) -> Self {
        Self(Sha1::digest(url.as_bytes()).into())
    }

    /// Hash an arbitrary byte string into an id
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Sha1Git {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Sha1Git {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Git({})", self.to_hex())
    }
}

impl FromStr for Sha1Git {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<&[u8]> for Sha1Git {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(format!("{} bytes, expected 20", bytes.len())))?;
        Ok(Self(bytes))
    }
}

/// A versioned identifier as printed by user-facing tools,
/// e.g. `swh:1:cnt:94a9ed024d3859793618152ea559a168bbcbb5e2`
pub fn parse_swhid(s: &str) -> Result<Sha1Git> {
    match s.split(':').collect::<Vec<_>>().as_slice() {
        ["swh", "1", _object_type, hex] => Sha1Git::from_hex(hex),
        [hex] => Sha1Git::from_hex(hex),
        _ => Err(Error::InvalidId(s.to_string())),
    }
}

/// A file (blob) reachable from a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: Sha1Git,
    pub name: Vec<u8>,
}

/// A directory node of the DAG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: Sha1Git,
    pub name: Vec<u8>,
}

impl DirectoryEntry {
    /// A directory referenced by id only (CSV ingestion, flatten passes)
    pub fn bare(id: Sha1Git) -> Self {
        Self { id, name: Vec::new() }
    }
}

/// A revision with its author date and root directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionEntry {
    pub id: Sha1Git,
    pub date: DateTime<Utc>,
    pub root: Sha1Git,
}

/// An origin visit: the origin URL and the snapshot the visit recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginEntry {
    pub id: Sha1Git,
    pub url: String,
    pub snapshot: Sha1Git,
}

impl OriginEntry {
    pub fn new(url: String, snapshot: Sha1Git) -> Self {
        let id = Sha1Git::from_url(&url);
        Self { id, url, snapshot }
    }
}

/// Join a directory prefix and an entry name with `/`.
///
/// An empty prefix yields the name unchanged, so paths stay relative
/// without a leading separator.
pub fn join_path(prefix: &[u8], name: &[u8]) -> Vec<u8> {
    if prefix.is_empty() {
        name.to_vec()
    } else {
        let mut path = Vec::with_capacity(prefix.len() + 1 + name.len());
        path.extend_from_slice(prefix);
        path.push(b'/');
        path.extend_from_slice(name);
        path
    }
}

/// Strip a leading `./` from a relation path
pub fn normalize_path(path: &[u8]) -> Vec<u8> {
    if path.starts_with(b"./") {
        path[2..].to_vec()
    } else {
        path.to_vec()
    }
}
