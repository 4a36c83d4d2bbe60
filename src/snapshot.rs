//! SQLite snapshots of the vector index.
//!
//! A snapshot directory holds `index.sqlite` (entries with little-endian
//! f32 vector BLOBs, plus a `snapshot_meta` key/value table) and a
//! `config.toml` copy of the configuration active when it was saved.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use medrag_core::embedding::{blob_to_vec, vec_to_blob};
use medrag_core::models::{Chunk, EntryMetadata, IndexEntry};

use crate::db;
use crate::error::{RagError, Result};
use crate::migrate;

pub const INDEX_FILE: &str = "index.sqlite";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotMeta {
    pub dims: usize,
    pub provider: String,
    pub model: String,
    pub saved_at: DateTime<Utc>,
    pub entries: usize,
}

fn decode_err(msg: String) -> RagError {
    RagError::Storage(sqlx::Error::Decode(msg.into()))
}

/// Replace the snapshot in `dir` with `entries`.
pub async fn save(dir: &Path, entries: &[Arc<IndexEntry>], meta: &SnapshotMeta) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let pool = db::connect(&dir.join(INDEX_FILE)).await?;
    migrate::run_migrations(&pool).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM entries").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM snapshot_meta").execute(&mut *tx).await?;

    for (position, entry) in entries.iter().enumerate() {
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|e| RagError::Storage(sqlx::Error::Encode(Box::new(e))))?;
        let chunk = &entry.chunk;
        sqlx::query(
            "INSERT INTO entries (id, position, document_id, chunk_index, total_chunks, section, content, length, hash, metadata_json, vector)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(position as i64)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index as i64)
        .bind(chunk.total_chunks as i64)
        .bind(&chunk.section)
        .bind(&chunk.content)
        .bind(chunk.length as i64)
        .bind(&chunk.hash)
        .bind(metadata_json)
        .bind(vec_to_blob(&entry.vector))
        .execute(&mut *tx)
        .await?;
    }

    let meta_rows = [
        ("dims", meta.dims.to_string()),
        ("provider", meta.provider.clone()),
        ("model", meta.model.clone()),
        ("saved_at", meta.saved_at.to_rfc3339()),
        ("entries", entries.len().to_string()),
    ];
    for (key, value) in meta_rows {
        sqlx::query("INSERT INTO snapshot_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    pool.close().await;
    Ok(())
}

/// Read the snapshot in `dir`. Returns `None` when none was saved there.
pub async fn load(dir: &Path) -> Result<Option<(SnapshotMeta, Vec<IndexEntry>)>> {
    let path = dir.join(INDEX_FILE);
    if !path.is_file() {
        return Ok(None);
    }

    let pool = db::connect(&path).await?;
    migrate::run_migrations(&pool).await?;

    let meta: HashMap<String, String> = sqlx::query("SELECT key, value FROM snapshot_meta")
        .fetch_all(&pool)
        .await?
        .into_iter()
        .map(|row| (row.get("key"), row.get("value")))
        .collect();

    let field = |key: &str| -> Result<&String> {
        meta.get(key)
            .ok_or_else(|| decode_err(format!("snapshot is missing '{}'", key)))
    };
    let dims: usize = field("dims")?
        .parse()
        .map_err(|_| decode_err("snapshot 'dims' is not a number".into()))?;
    let saved_at = DateTime::parse_from_rfc3339(field("saved_at")?)
        .map_err(|e| decode_err(format!("snapshot 'saved_at': {}", e)))?
        .with_timezone(&Utc);

    let rows = sqlx::query(
        "SELECT id, document_id, chunk_index, total_chunks, section, content, length, hash, metadata_json, vector
         FROM entries ORDER BY position",
    )
    .fetch_all(&pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let metadata_json: String = row.get("metadata_json");
        let metadata: EntryMetadata = serde_json::from_str(&metadata_json)
            .map_err(|e| RagError::Storage(sqlx::Error::Decode(Box::new(e))))?;
        let blob: Vec<u8> = row.get("vector");
        let chunk_index: i64 = row.get("chunk_index");
        let total_chunks: i64 = row.get("total_chunks");
        let length: i64 = row.get("length");
        entries.push(IndexEntry::new(
            Chunk {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: chunk_index as usize,
                total_chunks: total_chunks as usize,
                section: row.get("section"),
                content: row.get("content"),
                length: length as usize,
                hash: row.get("hash"),
            },
            blob_to_vec(&blob),
            metadata,
        ));
    }
    pool.close().await;

    let meta = SnapshotMeta {
        dims,
        provider: field("provider")?.clone(),
        model: field("model")?.clone(),
        saved_at,
        entries: entries.len(),
    };
    Ok(Some((meta, entries)))
}
