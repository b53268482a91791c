//! Reference embeddings, serialised as JSON arrays.
//!
//! SQLite has no vector index here, so `similarity_search` keeps the trait
//! default and the matcher scans `all_embeddings`.

use crate::database::{map_err, Database};
use async_trait::async_trait;
use rollcall_core::{Embedding, ReferenceEntry, ReferenceStore, ReferenceWriter, StoreError};
use rusqlite::params;

#[async_trait]
impl ReferenceStore for Database {
    async fn all_embeddings(&self) -> Result<Vec<ReferenceEntry>, StoreError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT identity_id, embedding, model_version
                     FROM reference_embeddings ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_err)?;

        rows.into_iter()
            .map(|(identity_id, json, model_version)| {
                let values: Vec<f32> = serde_json::from_str(&json).map_err(|e| {
                    StoreError::Corrupt(format!("embedding for {identity_id}: {e}"))
                })?;
                Ok(ReferenceEntry::new(
                    identity_id,
                    Embedding {
                        values,
                        model_version,
                    },
                ))
            })
            .collect()
    }
}

#[async_trait]
impl ReferenceWriter for Database {
    async fn add_reference(&self, entry: ReferenceEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(&entry.embedding.values)
            .map_err(|e| StoreError::Backend(format!("encode embedding: {e}")))?;
        let created_at = chrono::Utc::now().to_rfc3339();
        let identity = entry.identity_id.clone();

        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO reference_embeddings (identity_id, embedding, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![entry.identity_id, json, entry.embedding.model_version, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)?;

        tracing::debug!(identity = %identity, "reference embedding stored");
        Ok(())
    }
}

impl Database {
    /// Number of stored samples per identity, ordered by identity.
    pub async fn reference_counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT identity_id, COUNT(*) FROM reference_embeddings
                     GROUP BY identity_id ORDER BY identity_id",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_err)
    }
}
