// src/origin.rs

//! Origin layer: attach revisions to the origins that serve them
//!
//! For each origin visit, the snapshot's head revisions are collected,
//! each unseen head's history is walked through the archive, every
//! ancestor is linked to the head, and revisions pick the first origin
//! that reaches them as their preferred one.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::BufRead;

use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::model::{OriginEntry, Sha1Git};
use crate::provenance::Provenance;

/// Reverse-reachability graph of one head revision over parent edges
pub struct HistoryGraph {
    head: Sha1Git,
    nodes: HashSet<Sha1Git>,
    /// revision -> its parents
    edges: HashMap<Sha1Git, HashSet<Sha1Git>>,
}

impl HistoryGraph {
    /// Walk the history of `head` through the archive. Diamond merges make
    /// revisions reachable along several paths, so visited revisions are
    /// never expanded twice.
    pub fn build<A: Archive>(archive: &A, head: Sha1Git) -> Result<Self> {
        let mut nodes: HashSet<Sha1Git> = HashSet::new();
        let mut edges: HashMap<Sha1Git, HashSet<Sha1Git>> = HashMap::new();
        let mut stack = vec![head];

        while let Some(current) = stack.pop() {
            // A revision already in the graph had all its edges returned
            // by an earlier archive call
            if !nodes.insert(current) {
                continue;
            }
            edges.entry(current).or_default();
            for (rev, parent) in archive.revision_get_some_outbound_edges(current)? {
                nodes.insert(rev);
                edges.entry(rev).or_default().insert(parent);
                if !nodes.contains(&parent) {
                    stack.push(parent);
                }
            }
        }

        Ok(Self { head, nodes, edges })
    }

    pub fn head_id(&self) -> Sha1Git {
        self.head
    }

    /// Every revision of the graph except the head itself
    pub fn parent_ids(&self) -> BTreeSet<Sha1Git> {
        self.nodes
            .iter()
            .filter(|id| **id != self.head)
            .copied()
            .collect()
    }

    /// Parents of one revision inside the graph
    pub fn parents(&self, id: Sha1Git) -> Option<&HashSet<Sha1Git>> {
        self.edges.get(&id)
    }
}

/// Process a batch of origin visits and flush
pub fn origin_add<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    origins: &[OriginEntry],
    commit: bool,
) -> Result<()> {
    for origin in origins {
        process_origin(provenance, archive, origin)?;
    }
    if commit {
        debug!("Flushing cache");
        provenance.flush();
    }
    Ok(())
}

fn process_origin<A: Archive>(
    provenance: &mut Provenance,
    archive: &A,
    origin: &OriginEntry,
) -> Result<()> {
    info!("Processing origin {}", origin.url);
    provenance.origin_add(origin);

    let heads = archive.snapshot_get_heads(origin.snapshot)?;
    info!("{} heads found", heads.len());

    for (idx, head) in heads.iter().enumerate() {
        debug!("checking revision {} ({}/{})", head, idx + 1, heads.len());

        // A known head already had its history walked by some visit
        if !provenance.revision_is_head(*head)? {
            let graph = HistoryGraph::build(archive, *head)?;
            for ancestor in graph.parent_ids() {
                check_preferred_origin(provenance, origin, ancestor)?;
                provenance.revision_add_before_revision(graph.head_id(), ancestor);
            }
        }

        check_preferred_origin(provenance, origin, *head)?;
        provenance.revision_add_to_origin(origin, *head);

        if provenance.flush_if_necessary() {
            debug!("Intermediate cache flush");
        }
    }
    Ok(())
}

/// First-writer-wins preferred origin
fn check_preferred_origin(
    provenance: &mut Provenance,
    origin: &OriginEntry,
    revision: Sha1Git,
) -> Result<()> {
    if provenance.revision_get_preferred_origin(revision)?.is_none() {
        provenance.revision_set_preferred_origin(origin, revision);
    }
    Ok(())
}

/// Parse `url,snapshot-hex` rows. Rows that do not parse are skipped and
/// counted.
pub fn origins_from_csv<R: BufRead>(reader: R) -> Result<Vec<OriginEntry>> {
    let mut origins = Vec::new();
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_origin_row(line) {
            Ok(origin) => origins.push(origin),
            Err(err) => {
                warn!("Skipping origin row {:?}: {}", line, err);
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        info!("Skipped {} malformed origin rows", skipped);
    }
    Ok(origins)
}

fn parse_origin_row(line: &str) -> Result<OriginEntry> {
    // URLs may embed commas; the snapshot id is the last field
    let (url, snapshot) = line
        .rsplit_once(',')
        .ok_or_else(|| Error::InvalidInput(format!("expected 2 comma-separated fields: {}", line)))?;
    if url.trim().is_empty() {
        return Err(Error::InvalidInput(format!("empty origin url: {}", line)));
    }
    Ok(OriginEntry::new(
        url.trim().to_string(),
        Sha1Git::from_hex(snapshot)?,
    ))
}
