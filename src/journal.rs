// src/journal.rs

//! Journaling of provenance additions
//!
//! Every date, URL and relation edge written to the storage can be teed to
//! a journal as a keyed message, so a separate deployment can be rebuilt by
//! replaying it. Message keys make replay idempotent: entity messages are
//! keyed by the entity id, relation messages by the hash of
//! `src ++ dst ++ path`. The directory flat flag is not journaled; flat
//! models are reconstructed by replaying the relation messages.

use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, Write};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::types::{DirectoryData, RelationEdge, RelationKind, RevisionData};
use crate::db::ProvenanceStorage;
use crate::error::{Error, Result};
use crate::model::Sha1Git;

/// Key of a relation message: sha1 over `src ++ dst ++ path`
pub fn relation_key(src: Sha1Git, dst: Sha1Git, path: Option<&[u8]>) -> Sha1Git {
    let mut data = Vec::with_capacity(40 + path.map_or(0, <[u8]>::len));
    data.extend_from_slice(src.as_bytes());
    data.extend_from_slice(dst.as_bytes());
    if let Some(path) = path {
        data.extend_from_slice(path);
    }
    Sha1Git::digest(&data)
}

/// One journaled addition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalMessage {
    Content {
        id: Sha1Git,
        date: DateTime<Utc>,
    },
    Directory {
        id: Sha1Git,
        date: DateTime<Utc>,
    },
    Revision {
        id: Sha1Git,
        date: DateTime<Utc>,
    },
    Origin {
        id: Sha1Git,
        url: String,
    },
    Relation {
        kind: RelationKind,
        key: Sha1Git,
        src: Sha1Git,
        dst: Sha1Git,
        path: Option<Vec<u8>>,
    },
}

impl JournalMessage {
    pub fn content(id: Sha1Git, date: DateTime<Utc>) -> Self {
        JournalMessage::Content { id, date }
    }

    pub fn directory(id: Sha1Git, date: DateTime<Utc>) -> Self {
        JournalMessage::Directory { id, date }
    }

    pub fn revision(id: Sha1Git, date: DateTime<Utc>) -> Self {
        JournalMessage::Revision { id, date }
    }

    pub fn origin(id: Sha1Git, url: String) -> Self {
        JournalMessage::Origin { id, url }
    }

    pub fn relation(
        kind: RelationKind,
        key: Sha1Git,
        src: Sha1Git,
        dst: Sha1Git,
        path: Option<Vec<u8>>,
    ) -> Self {
        JournalMessage::Relation {
            kind,
            key,
            src,
            dst,
            path,
        }
    }

    /// The idempotency key of this message
    pub fn key(&self) -> Sha1Git {
        match self {
            JournalMessage::Content { id, .. }
            | JournalMessage::Directory { id, .. }
            | JournalMessage::Revision { id, .. }
            | JournalMessage::Origin { id, .. } => *id,
            JournalMessage::Relation { key, .. } => *key,
        }
    }
}

/// Serialized message line: object type, key, and a value whose shape
/// depends on the type. Paths are hex-encoded since JSON cannot carry raw
/// bytes.
#[derive(Debug, Serialize, Deserialize)]
struct MessageLine {
    #[serde(rename = "type")]
    object_type: String,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::InvalidInput(format!("odd-length hex: {}", hex)));
    }
    (0..hex.len() / 2)
        .map(|i| {
            u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::InvalidInput(format!("bad hex: {}", hex)))
        })
        .collect()
}

impl JournalMessage {
    fn to_line(&self) -> MessageLine {
        let mut line = MessageLine {
            object_type: String::new(),
            key: self.key().to_hex(),
            date: None,
            url: None,
            src: None,
            dst: None,
            path: None,
        };
        match self {
            JournalMessage::Content { date, .. } => {
                line.object_type = "content".to_string();
                line.date = Some(date.timestamp());
            }
            JournalMessage::Directory { date, .. } => {
                line.object_type = "directory".to_string();
                line.date = Some(date.timestamp());
            }
            JournalMessage::Revision { date, .. } => {
                line.object_type = "revision".to_string();
                line.date = Some(date.timestamp());
            }
            JournalMessage::Origin { url, .. } => {
                line.object_type = "origin".to_string();
                line.url = Some(url.clone());
            }
            JournalMessage::Relation {
                kind,
                src,
                dst,
                path,
                ..
            } => {
                line.object_type = kind.table().to_string();
                line.src = Some(src.to_hex());
                line.dst = Some(dst.to_hex());
                line.path = path.as_deref().map(hex_encode);
            }
        }
        line
    }

    fn from_line(line: MessageLine) -> Result<Self> {
        let key = Sha1Git::from_hex(&line.key)?;
        let date = |line: &MessageLine| -> Result<DateTime<Utc>> {
            let secs = line
                .date
                .ok_or_else(|| Error::InvalidInput("missing date".to_string()))?;
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {}", secs)))
        };
        match line.object_type.as_str() {
            "content" => Ok(JournalMessage::content(key, date(&line)?)),
            "directory" => Ok(JournalMessage::directory(key, date(&line)?)),
            "revision" => Ok(JournalMessage::revision(key, date(&line)?)),
            "origin" => {
                let url = line
                    .url
                    .ok_or_else(|| Error::InvalidInput("missing url".to_string()))?;
                Ok(JournalMessage::origin(key, url))
            }
            other => {
                let kind = other
                    .parse::<RelationKind>()
                    .map_err(Error::InvalidInput)?;
                let src = Sha1Git::from_hex(
                    line.src
                        .as_deref()
                        .ok_or_else(|| Error::InvalidInput("missing src".to_string()))?,
                )?;
                let dst = Sha1Git::from_hex(
                    line.dst
                        .as_deref()
                        .ok_or_else(|| Error::InvalidInput("missing dst".to_string()))?,
                )?;
                let path = line.path.as_deref().map(hex_decode).transpose()?;
                Ok(JournalMessage::relation(kind, key, src, dst, path))
            }
        }
    }
}

/// Sink for journaled additions
pub trait JournalWriter {
    fn write_message(&mut self, msg: JournalMessage) -> Result<()>;
}

/// Journal collecting messages in memory; handles are cheap clones sharing
/// the same buffer, so tests can keep one while the storage owns another
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    messages: Rc<std::cell::RefCell<Vec<JournalMessage>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<JournalMessage> {
        self.messages.borrow().clone()
    }
}

impl JournalWriter for MemoryJournal {
    fn write_message(&mut self, msg: JournalMessage) -> Result<()> {
        self.messages.borrow_mut().push(msg);
        Ok(())
    }
}

/// Journal appending one JSON document per line
pub struct FileJournal<W: Write> {
    writer: W,
}

impl<W: Write> FileJournal<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> JournalWriter for FileJournal<W> {
    fn write_message(&mut self, msg: JournalMessage) -> Result<()> {
        let line = serde_json::to_string(&msg.to_line())
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }
}

/// Parse a JSONL journal back into messages
pub fn read_messages<R: BufRead>(reader: R) -> Result<Vec<JournalMessage>> {
    let mut messages = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: MessageLine = serde_json::from_str(&line)
            .map_err(|e| Error::InvalidInput(format!("bad journal line: {}", e)))?;
        messages.push(JournalMessage::from_line(parsed)?);
    }
    Ok(messages)
}

/// Re-apply journaled messages to a storage.
///
/// Entities are applied before relations so the date merges land on the
/// same rows the relations reference; within each group the storage's own
/// merge semantics make replay idempotent.
pub fn replay(messages: &[JournalMessage], storage: &mut ProvenanceStorage) -> Result<()> {
    let mut contents: HashMap<Sha1Git, DateTime<Utc>> = HashMap::new();
    let mut directories: HashMap<Sha1Git, DirectoryData> = HashMap::new();
    let mut revisions: HashMap<Sha1Git, RevisionData> = HashMap::new();
    let mut origins: HashMap<Sha1Git, String> = HashMap::new();
    let mut relations: HashMap<RelationKind, HashMap<Sha1Git, BTreeSet<RelationEdge>>> =
        HashMap::new();

    for msg in messages {
        match msg {
            JournalMessage::Content { id, date } => {
                merge_min(&mut contents, *id, *date);
            }
            JournalMessage::Directory { id, date } => {
                let entry = directories.entry(*id).or_insert(DirectoryData {
                    date: Some(*date),
                    flat: false,
                });
                if entry.date.map_or(true, |d| *date < d) {
                    entry.date = Some(*date);
                }
            }
            JournalMessage::Revision { id, date } => {
                let entry = revisions.entry(*id).or_default();
                if entry.date.map_or(true, |d| *date < d) {
                    entry.date = Some(*date);
                }
            }
            JournalMessage::Origin { id, url } => {
                origins.entry(*id).or_insert_with(|| url.clone());
            }
            JournalMessage::Relation {
                kind,
                src,
                dst,
                path,
                ..
            } => {
                relations
                    .entry(*kind)
                    .or_default()
                    .entry(*src)
                    .or_default()
                    .insert(RelationEdge {
                        dst: *dst,
                        path: path.clone(),
                    });
            }
        }
    }

    if !origins.is_empty() && !storage.origin_set(&origins) {
        return Err(Error::InvalidInput("replay: origin batch refused".to_string()));
    }
    if !contents.is_empty() && !storage.content_set_date(&contents) {
        return Err(Error::InvalidInput("replay: content batch refused".to_string()));
    }
    if !directories.is_empty() && !storage.directory_set(&directories) {
        return Err(Error::InvalidInput(
            "replay: directory batch refused".to_string(),
        ));
    }
    if !revisions.is_empty() && !storage.revision_set(&revisions) {
        return Err(Error::InvalidInput(
            "replay: revision batch refused".to_string(),
        ));
    }
    for kind in RelationKind::ALL {
        if let Some(data) = relations.get(&kind) {
            if !storage.relation_add(kind, data) {
                return Err(Error::InvalidInput(format!(
                    "replay: {} batch refused",
                    kind.table()
                )));
            }
        }
    }
    Ok(())
}

fn merge_min(map: &mut HashMap<Sha1Git, DateTime<Utc>>, id: Sha1Git, date: DateTime<Utc>) {
    map.entry(id)
        .and_modify(|d| {
            if date < *d {
                *d = date;
            }
        })
        .or_insert(date);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::DbFlavor;

    fn id(byte: u8) -> Sha1Git {
        Sha1Git([byte; 20])
    }

    fn date(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_relation_key_depends_on_all_parts() {
        let base = relation_key(id(1), id(2), Some(b"a"));
        assert_eq!(base, relation_key(id(1), id(2), Some(b"a")));
        assert_ne!(base, relation_key(id(1), id(2), Some(b"b")));
        assert_ne!(base, relation_key(id(1), id(3), Some(b"a")));
        assert_ne!(base, relation_key(id(1), id(2), None));
    }

    #[test]
    fn test_message_line_round_trip() {
        let messages = vec![
            JournalMessage::content(id(1), date(1000)),
            JournalMessage::directory(id(2), date(2000)),
            JournalMessage::revision(id(3), date(3000)),
            JournalMessage::origin(id(4), "https://example.com".to_string()),
            JournalMessage::relation(
                RelationKind::CntEarlyInRev,
                relation_key(id(1), id(3), Some(b"src/a")),
                id(1),
                id(3),
                Some(b"src/a".to_vec()),
            ),
            JournalMessage::relation(
                RelationKind::RevBeforeRev,
                relation_key(id(5), id(3), None),
                id(5),
                id(3),
                None,
            ),
        ];

        let mut buffer = Vec::new();
        {
            let mut journal = FileJournal::new(&mut buffer);
            for msg in &messages {
                journal.write_message(msg.clone()).unwrap();
            }
        }

        let parsed = read_messages(buffer.as_slice()).unwrap();
        assert_eq!(parsed, messages);
    }

    #[test]
    fn test_storage_writes_are_journaled() {
        let mut storage = ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap();
        let journal = MemoryJournal::new();
        storage.set_journal(Box::new(journal.clone()));

        storage.content_set_date(&HashMap::from([(id(1), date(1000))]));
        let mut data = HashMap::new();
        data.insert(
            id(1),
            BTreeSet::from([RelationEdge {
                dst: id(2),
                path: Some(b"a".to_vec()),
            }]),
        );
        storage.relation_add(RelationKind::CntEarlyInRev, &data);

        let messages = journal.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], JournalMessage::content(id(1), date(1000)));
        assert!(matches!(
            &messages[1],
            JournalMessage::Relation {
                kind: RelationKind::CntEarlyInRev,
                ..
            }
        ));
    }

    #[test]
    fn test_replay_reproduces_storage() {
        let mut source = ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap();
        let journal = MemoryJournal::new();
        source.set_journal(Box::new(journal.clone()));

        source.origin_set(&HashMap::from([(id(9), "https://o".to_string())]));
        source.content_set_date(&HashMap::from([(id(1), date(1000))]));
        source.revision_set(&HashMap::from([(
            id(2),
            RevisionData {
                date: Some(date(1000)),
                origin: None,
            },
        )]));
        let mut data = HashMap::new();
        data.insert(
            id(1),
            BTreeSet::from([RelationEdge {
                dst: id(2),
                path: Some(b"a".to_vec()),
            }]),
        );
        source.relation_add(RelationKind::CntEarlyInRev, &data);

        let mut replica = ProvenanceStorage::in_memory(DbFlavor::WithPath).unwrap();
        replay(&journal.messages(), &mut replica).unwrap();

        for entity in [
            crate::db::EntityKind::Content,
            crate::db::EntityKind::Revision,
            crate::db::EntityKind::Origin,
        ] {
            assert_eq!(
                source.entity_get_all(entity).unwrap(),
                replica.entity_get_all(entity).unwrap()
            );
        }
        assert_eq!(
            source.relation_get_all(RelationKind::CntEarlyInRev).unwrap(),
            replica.relation_get_all(RelationKind::CntEarlyInRev).unwrap()
        );
        assert_eq!(
            replica.content_get(&[id(1)]).unwrap()[&id(1)],
            date(1000)
        );
        // Replaying twice changes nothing
        replay(&journal.messages(), &mut replica).unwrap();
        assert_eq!(
            source.relation_get_all(RelationKind::CntEarlyInRev).unwrap(),
            replica.relation_get_all(RelationKind::CntEarlyInRev).unwrap()
        );
    }
}
