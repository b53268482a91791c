use crate::database::{map_err, Database};
use async_trait::async_trait;
use rollcall_core::{AuditEntry, AuditStore, StoreError};
use rusqlite::params;

#[async_trait]
impl AuditStore for Database {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO audit_log
                         (identity_id, reason, liveness_score, subject_context, detail, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entry.identity_id,
                        entry.reason.as_str(),
                        entry.liveness_score.map(f64::from),
                        entry.subject_context,
                        entry.detail,
                        entry.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }
}

impl Database {
    /// Audit entry counts by reason, most frequent first.
    pub async fn audit_summary(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT reason, COUNT(*) AS n FROM audit_log
                     GROUP BY reason ORDER BY n DESC, reason",
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

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::AuditReason;

    #[tokio::test]
    async fn test_append_and_summarise() {
        let db = Database::open_in_memory().await.unwrap();
        db.append(AuditEntry::new(AuditReason::LowLivenessScore, Some("math")).with_liveness(0.2))
            .await
            .unwrap();
        db.append(AuditEntry::new(AuditReason::UnknownFace, None))
            .await
            .unwrap();
        db.append(
            AuditEntry::new(AuditReason::LowLivenessScore, None)
                .with_identity(Some("s1".into()))
                .with_detail("retry"),
        )
        .await
        .unwrap();

        let summary = db.audit_summary().await.unwrap();
        assert_eq!(
            summary,
            vec![
                ("low_liveness_score".to_string(), 2),
                ("unknown_face".to_string(), 1)
            ]
        );
    }
}
