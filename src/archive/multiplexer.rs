// src/archive/multiplexer.rs

//! Fallback chain over several archive backends
//!
//! Tries each backend in order and returns the first non-empty answer,
//! counting which backend served each method so operators can see where
//! lookups are actually resolved.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::archive::{Archive, DirectoryListEntry};
use crate::error::Result;
use crate::model::{RevisionEntry, Sha1Git};

/// Archive that multiplexes over an ordered list of named backends
pub struct Multiplexer<A> {
    backends: Vec<(String, A)>,
    ops: RefCell<HashMap<(String, &'static str), u64>>,
}

impl<A: Archive> Multiplexer<A> {
    pub fn new(backends: Vec<(String, A)>) -> Self {
        Self {
            backends,
            ops: RefCell::new(HashMap::new()),
        }
    }

    /// Per-(backend, method) counters of answered calls
    pub fn operation_counts(&self) -> HashMap<(String, &'static str), u64> {
        self.ops.borrow().clone()
    }

    fn count(&self, backend: &str, method: &'static str) {
        *self
            .ops
            .borrow_mut()
            .entry((backend.to_string(), method))
            .or_insert(0) += 1;
    }
}

impl<A: Archive> Archive for Multiplexer<A> {
    fn directory_ls(&self, id: Sha1Git, minsize: u64) -> Result<Vec<DirectoryListEntry>> {
        for (name, backend) in &self.backends {
            match backend.directory_ls(id, minsize) {
                Ok(entries) if !entries.is_empty() => {
                    self.count(name, "directory_ls");
                    return Ok(entries);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("Error listing directory {} via {}: {}", id, name, err);
                }
            }
        }
        self.count("empty_or_not_found", "directory_ls");
        debug!("directory empty or not found: {}", id);
        Ok(Vec::new())
    }

    fn revision_get_some_outbound_edges(
        &self,
        id: Sha1Git,
    ) -> Result<Vec<(Sha1Git, Sha1Git)>> {
        for (name, backend) in &self.backends {
            match backend.revision_get_some_outbound_edges(id) {
                Ok(edges) if !edges.is_empty() => {
                    self.count(name, "revision_get_some_outbound_edges");
                    return Ok(edges);
                }
                Ok(_) => {
                    debug!("No outbound edges for revision {} via {}", id, name);
                }
                Err(err) => {
                    warn!(
                        "Error retrieving outbound edges of revision {} via {}: {}",
                        id, name, err
                    );
                }
            }
        }
        self.count("no_parents_or_not_found", "revision_get_some_outbound_edges");
        Ok(Vec::new())
    }

    fn revisions_get(&self, ids: &[Sha1Git]) -> Result<Vec<RevisionEntry>> {
        for (name, backend) in &self.backends {
            match backend.revisions_get(ids) {
                Ok(revs) if !revs.is_empty() => {
                    self.count(name, "revisions_get");
                    return Ok(revs);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("Error retrieving revisions via {}: {}", name, err);
                }
            }
        }
        self.count("not_found", "revisions_get");
        Ok(Vec::new())
    }

    fn snapshot_get_heads(&self, id: Sha1Git) -> Result<Vec<Sha1Git>> {
        for (name, backend) in &self.backends {
            match backend.snapshot_get_heads(id) {
                Ok(heads) if !heads.is_empty() => {
                    self.count(name, "snapshot_get_heads");
                    return Ok(heads);
                }
                Ok(_) => {
                    debug!("No heads for snapshot {} via {}", id, name);
                }
                Err(err) => {
                    warn!("Error retrieving heads of snapshot {} via {}: {}", id, name, err);
                }
            }
        }
        self.count("no_heads_or_not_found", "snapshot_get_heads");
        Ok(Vec::new())
    }
}
