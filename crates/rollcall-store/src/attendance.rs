//! Attendance rows. The unique index on (identity, day, subject) turns a
//! lost check-then-insert race into `StoreError::Conflict`. Subjects are
//! normalised before they reach SQL, so blank and `global` are stored as NULL.

use crate::database::{map_err, Database};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{
    normalize_subject, AttendanceRecord, AttendanceStatus, AttendanceStore, StoreError,
};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

#[async_trait]
impl AttendanceStore for Database {
    async fn exists(
        &self,
        identity_id: &str,
        day: NaiveDate,
        subject_context: Option<&str>,
    ) -> Result<bool, StoreError> {
        let identity_id = identity_id.to_string();
        let day = day.to_string();
        let subject = normalize_subject(subject_context).map(str::to_owned);

        self.conn
            .call(move |c| {
                let found = c
                    .query_row(
                        "SELECT 1 FROM attendance
                         WHERE identity_id = ?1 AND day = ?2
                           AND COALESCE(subject_context, '') = COALESCE(?3, '')
                         LIMIT 1",
                        params![identity_id, day, subject],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await
            .map_err(map_err)
    }

    async fn insert(&self, mut record: AttendanceRecord) -> Result<AttendanceRecord, StoreError> {
        record.subject_context =
            normalize_subject(record.subject_context.as_deref()).map(str::to_owned);
        let row = record.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO attendance
                         (id, identity_id, day, subject_context, status, confidence, marked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id.to_string(),
                        row.identity_id,
                        row.day.to_string(),
                        row.subject_context,
                        row.status.as_str(),
                        row.confidence as f64,
                        row.marked_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)?;
        Ok(record)
    }
}

type RawRecord = (String, String, String, Option<String>, String, f64, String);

impl Database {
    /// Attendance records for `day`, in marking order.
    pub async fn attendance_on(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let day_text = day.to_string();
        let rows: Vec<RawRecord> = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, identity_id, day, subject_context, status, confidence, marked_at
                     FROM attendance WHERE day = ?1 ORDER BY marked_at",
                )?;
                let rows = stmt
                    .query_map([day_text], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_err)?;

        rows.into_iter().map(decode_record).collect()
    }
}

fn decode_record(raw: RawRecord) -> Result<AttendanceRecord, StoreError> {
    let (id, identity_id, day, subject_context, status, confidence, marked_at) = raw;
    let corrupt = |what: &str, e: String| StoreError::Corrupt(format!("attendance {id} {what}: {e}"));

    Ok(AttendanceRecord {
        id: Uuid::parse_str(&id).map_err(|e| corrupt("id", e.to_string()))?,
        day: day.parse().map_err(|e: chrono::ParseError| corrupt("day", e.to_string()))?,
        status: status
            .parse::<AttendanceStatus>()
            .map_err(|e| corrupt("status", e))?,
        marked_at: DateTime::parse_from_rfc3339(&marked_at)
            .map_err(|e| corrupt("marked_at", e.to_string()))?
            .with_timezone(&Utc),
        identity_id,
        subject_context,
        confidence: confidence as f32,
    })
}
