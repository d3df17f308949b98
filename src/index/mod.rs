//! Entity index — persistent entity → chunk inverted index for one store.
//!
//! Two files live under the index directory:
//! - `entities.json` — the vocabulary, an ordered JSON array of strings.
//!   An entity's id (`eid`) is its position in this array.
//! - `entity2chunk.sqlite` — one row per `eid` listing the chunk ids the
//!   entity occurs in, comma-joined.
//!
//! The vocabulary and the relation table must describe the same generation:
//! whoever replaces the vocabulary clears the relations too.  Relations are
//! append-once; a second insert for the same `eid` is a conflict.
//!
//! An `EntityIndex` owns its connection; it is dropped (and the database
//! closed) with the value.

pub mod cache;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::debug;

use crate::error::AppError;

/// Directory name of the index inside a store's workdir.
pub const INDEX_DIR: &str = "db_reverted_index";
pub const DB_FILENAME: &str = "entity2chunk.sqlite";
pub const VOCABULARY_FILENAME: &str = "entities.json";

pub struct EntityIndex {
    dir: PathBuf,
    conn: Connection,
    entities: Vec<String>,
    case_insensitive: bool,
}

impl EntityIndex {
    /// Open (or create) the index in `dir`, loading any saved vocabulary.
    pub fn open(dir: &Path, case_insensitive: bool) -> Result<Self, AppError> {
        std::fs::create_dir_all(dir)?;

        let db_path = dir.join(DB_FILENAME);
        let conn = Connection::open(&db_path)
            .map_err(|e| AppError::Index(format!("open {}: {e}", db_path.display())))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| AppError::Index(format!("set busy_timeout: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                eid INTEGER PRIMARY KEY,
                chunk_ids TEXT NOT NULL
            );",
        )
        .map_err(|e| AppError::Index(format!("initialize schema: {e}")))?;

        let vocab_path = dir.join(VOCABULARY_FILENAME);
        let entities = if vocab_path.exists() {
            let raw = std::fs::read_to_string(&vocab_path)?;
            let loaded: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
                AppError::Index(format!("parse {}: {e}", vocab_path.display()))
            })?;
            loaded
                .into_iter()
                .map(|e| canonical(&e, case_insensitive))
                .collect()
        } else {
            Vec::new()
        };

        debug!(dir = %dir.display(), entities = entities.len(), "entity index opened");
        Ok(Self { dir: dir.to_path_buf(), conn, entities, case_insensitive })
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.entities
    }

    /// Replace the vocabulary in memory and on disk.  Relations are left
    /// untouched.
    pub fn set_vocabulary(&mut self, entities: &[String]) -> Result<(), AppError> {
        let entities: Vec<String> = entities
            .iter()
            .map(|e| canonical(e, self.case_insensitive))
            .collect();

        let json = serde_json::to_string(&entities)
            .map_err(|e| AppError::Index(format!("serialize vocabulary: {e}")))?;
        let path = self.dir.join(VOCABULARY_FILENAME);
        let tmp = self.dir.join(format!("{VOCABULARY_FILENAME}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        debug!(entities = entities.len(), "vocabulary replaced");
        self.entities = entities;
        Ok(())
    }

    /// Delete every relation row; returns how many were removed.
    pub fn clear(&mut self) -> Result<usize, AppError> {
        self.conn
            .execute("DELETE FROM entities", [])
            .map_err(|e| AppError::Index(format!("clear relations: {e}")))
    }

    /// Ids of every vocabulary entry found as a substring of `text`, in
    /// ascending order.  Empty text matches nothing.
    pub fn match_entities(&self, text: &str) -> Result<Vec<usize>, AppError> {
        if self.entities.is_empty() {
            return Err(AppError::EntityConfiguration(
                "entity vocabulary is empty; set it before matching".into(),
            ));
        }
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let text = canonical(text, self.case_insensitive);
        Ok(self
            .entities
            .iter()
            .enumerate()
            .filter(|(_, e)| text.contains(e.as_str()))
            .map(|(eid, _)| eid)
            .collect())
    }

    /// Persist the chunk list for `eid`.
    pub fn insert_relation(&mut self, eid: usize, chunk_ids: &[u64]) -> Result<(), AppError> {
        let joined = chunk_ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let eid = eid as i64;
        match self.conn.execute(
            "INSERT INTO entities (eid, chunk_ids) VALUES (?1, ?2)",
            params![eid, joined],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(AppError::Uniqueness { eid })
            }
            Err(e) => Err(AppError::Index(format!("insert relation {eid}: {e}"))),
        }
    }

    /// Chunks related to `entity_ids` with the number of requested entities
    /// each one shares, highest count first.  Equal counts keep the order in
    /// which the chunks were first seen.
    pub fn chunks_for(&self, entity_ids: &[usize]) -> Result<Vec<(u64, usize)>, AppError> {
        let mut counts: Vec<(u64, usize)> = Vec::new();
        let mut slot: HashMap<u64, usize> = HashMap::new();

        for &eid in entity_ids {
            let Some(row) = self.relation(eid)? else { continue };
            let mut seen = Vec::with_capacity(row.len());
            for chunk in row {
                if seen.contains(&chunk) {
                    continue;
                }
                seen.push(chunk);
                match slot.get(&chunk) {
                    Some(&i) => counts[i].1 += 1,
                    None => {
                        slot.insert(chunk, counts.len());
                        counts.push((chunk, 1));
                    }
                }
            }
        }

        counts.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(counts)
    }

    pub fn relation_count(&self) -> Result<usize, AppError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
            .map_err(|e| AppError::Index(format!("count relations: {e}")))?;
        Ok(n as usize)
    }

    fn relation(&self, eid: usize) -> Result<Option<Vec<u64>>, AppError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT chunk_ids FROM entities WHERE eid = ?1",
                params![eid as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::Index(format!("read relation {eid}: {e}")))?;

        raw.map(|s| parse_chunk_ids(&s)).transpose()
    }
}

fn canonical(s: &str, case_insensitive: bool) -> String {
    if case_insensitive { s.to_lowercase() } else { s.to_string() }
}

fn parse_chunk_ids(raw: &str) -> Result<Vec<u64>, AppError> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim()
                .parse::<u64>()
                .map_err(|e| AppError::Index(format!("corrupt chunk id '{s}': {e}")))
        })
        .collect()
}
