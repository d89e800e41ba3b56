// src/dump.rs

//! Human-readable dump of the provenance model
//!
//! Walks the stored revisions in date order and prints, for each, its
//! direct blob occurrences, its frontier directories and the flat models
//! behind them. Meant for debugging small indexes, not for production
//! databases.

use std::io::Write;

use crate::db::types::{RelationEdge, RelationKind};
use crate::db::{EntityKind, ProvenanceStorage};
use crate::error::Result;
use crate::model::Sha1Git;

fn path_str(edge: &RelationEdge) -> String {
    String::from_utf8_lossy(edge.path.as_deref().unwrap_or_default()).into_owned()
}

/// Write the whole model to `writer`, revisions in date order
pub fn dump_storage<W: Write>(storage: &ProvenanceStorage, writer: &mut W) -> Result<()> {
    let revision_ids: Vec<Sha1Git> = storage
        .entity_get_all(EntityKind::Revision)?
        .into_iter()
        .collect();
    let revisions = storage.revision_get(&revision_ids)?;

    let mut dated: Vec<(i64, Sha1Git)> = revisions
        .iter()
        .filter_map(|(id, data)| data.date.map(|date| (date.timestamp(), *id)))
        .collect();
    dated.sort();

    for (idx, (timestamp, revision)) in dated.iter().enumerate() {
        let header = format!("R{:04}", idx);
        writeln!(writer, "{} {} {}", timestamp, revision, header)?;

        // Blobs occurring directly in this revision
        let contents = storage.relation_get(RelationKind::CntEarlyInRev, &[*revision], true)?;
        let content_dates = storage.content_get(&contents.keys().copied().collect::<Vec<_>>())?;
        let mut direct: Vec<(String, Sha1Git)> = contents
            .iter()
            .flat_map(|(blob, edges)| edges.iter().map(move |e| (path_str(e), *blob)))
            .collect();
        direct.sort();
        for (path, blob) in direct {
            let delta = content_dates
                .get(&blob)
                .map(|date| date.timestamp() - timestamp)
                .unwrap_or_default();
            writeln!(
                writer,
                "{} | R---C | {} | C {} | {:+}",
                header, path, blob, delta
            )?;
        }

        // Frontier directories of this revision, with their flat models
        let frontiers = storage.relation_get(RelationKind::DirInRev, &[*revision], true)?;
        let frontier_ids: Vec<Sha1Git> = frontiers.keys().copied().collect();
        let dir_data = storage.directory_get(&frontier_ids)?;
        let mut dirs: Vec<(String, Sha1Git)> = frontiers
            .iter()
            .flat_map(|(dir, edges)| edges.iter().map(move |e| (path_str(e), *dir)))
            .collect();
        dirs.sort();
        for (path, dir) in dirs {
            let delta = dir_data
                .get(&dir)
                .and_then(|data| data.date)
                .map(|date| date.timestamp() - timestamp)
                .unwrap_or_default();
            writeln!(
                writer,
                "{} | R-D   | {} | D {} | {:+}",
                header, path, dir, delta
            )?;

            let flat = storage.relation_get(RelationKind::CntInDir, &[dir], true)?;
            let blob_ids: Vec<Sha1Git> = flat.keys().copied().collect();
            let blob_dates = storage.content_get(&blob_ids)?;
            let mut blobs: Vec<(String, Sha1Git)> = flat
                .iter()
                .flat_map(|(blob, edges)| edges.iter().map(move |e| (path_str(e), *blob)))
                .collect();
            blobs.sort();
            for (blob_path, blob) in blobs {
                let delta = blob_dates
                    .get(&blob)
                    .map(|date| date.timestamp() - timestamp)
                    .unwrap_or_default();
                writeln!(
                    writer,
                    "{} |   D-C | {} | C {} | {:+}",
                    header, blob_path, blob, delta
                )?;
            }
        }
    }

    // Origins and their heads come last
    let origin_ids: Vec<Sha1Git> = storage
        .entity_get_all(EntityKind::Origin)?
        .into_iter()
        .collect();
    let urls = storage.origin_get(&origin_ids)?;
    for origin in origin_ids {
        let url = urls.get(&origin).map(String::as_str).unwrap_or("-");
        writeln!(writer, "O {} {}", origin, url)?;
        let heads = storage.relation_get(RelationKind::RevInOrg, &[origin], true)?;
        let mut head_ids: Vec<Sha1Git> = heads.keys().copied().collect();
        head_ids.sort();
        for head in head_ids {
            writeln!(writer, "O |   R-O | R {}", head)?;
        }
    }

    Ok(())
}
