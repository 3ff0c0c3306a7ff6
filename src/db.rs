use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    AttendanceFields, AttendanceKey, AttendanceRecord, AttendanceStatus, Note, Subject, SubjectId,
};
use crate::store::{
    AttendanceHistory, AttendanceStore, SubjectDirectory, SubjectRegistry, UpsertAction,
};

const DESCRIPTOR_DIMENSIONS: usize = 128;

const RECORD_COLUMNS: &str = "subject_id, log_date, period_number, subject_context, \
     display_name, cohort, status, note";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed subject directory and attendance log.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn period_to_db(period: u32) -> StoreResult<i32> {
    i32::try_from(period).map_err(|_| StoreError::Rejected(format!("period {period} out of range")))
}

fn row_to_record(row: &PgRow) -> StoreResult<AttendanceRecord> {
    let period: i32 = row.try_get("period_number")?;
    let status: String = row.try_get("status")?;
    let note: Option<String> = row.try_get("note")?;

    Ok(AttendanceRecord {
        key: AttendanceKey {
            subject_id: SubjectId::new(row.try_get::<String, _>("subject_id")?),
            date: row.try_get("log_date")?,
            period: u32::try_from(period)
                .map_err(|_| StoreError::Rejected(format!("stored period {period} is negative")))?,
            context: row.try_get("subject_context")?,
        },
        fields: AttendanceFields {
            display_name: row.try_get("display_name")?,
            cohort: row.try_get("cohort")?,
            status: status.parse::<AttendanceStatus>().map_err(StoreError::Rejected)?,
            note: note
                .as_deref()
                .map(str::parse::<Note>)
                .transpose()
                .map_err(StoreError::Rejected)?,
        },
    })
}

#[async_trait]
impl SubjectDirectory for PgStore {
    async fn load_subjects(&self, cohort: &str) -> StoreResult<Vec<Subject>> {
        let rows = sqlx::query(
            "SELECT subject_id, display_name, descriptor FROM attendance.subjects \
             WHERE cohort = $1 ORDER BY enrolled_at, subject_id",
        )
        .bind(cohort)
        .fetch_all(&self.pool)
        .await?;

        let mut subjects = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(descriptor): Json<Vec<f64>> = row.try_get("descriptor")?;
            subjects.push(Subject {
                id: SubjectId::new(row.try_get::<String, _>("subject_id")?),
                display_name: row.try_get("display_name")?,
                descriptor,
            });
        }

        Ok(subjects)
    }
}

#[async_trait]
impl SubjectRegistry for PgStore {
    async fn upsert_subject(&self, cohort: &str, subject: &Subject) -> StoreResult<UpsertAction> {
        let inserted: bool = sqlx::query(
            r#"
            INSERT INTO attendance.subjects (cohort, subject_id, display_name, descriptor)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (subject_id) DO UPDATE
            SET cohort = EXCLUDED.cohort,
                display_name = EXCLUDED.display_name,
                descriptor = EXCLUDED.descriptor
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(cohort)
        .bind(subject.id.as_str())
        .bind(&subject.display_name)
        .bind(Json(&subject.descriptor))
        .fetch_one(&self.pool)
        .await?
        .try_get("inserted")?;

        Ok(if inserted {
            UpsertAction::Created
        } else {
            UpsertAction::Updated
        })
    }
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn find(&self, key: &AttendanceKey) -> StoreResult<Option<AttendanceRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance.records \
             WHERE subject_id = $1 AND log_date = $2 AND period_number = $3 AND subject_context = $4"
        );
        let row = sqlx::query(&query)
            .bind(key.subject_id.as_str())
            .bind(key.date)
            .bind(period_to_db(key.period)?)
            .bind(&key.context)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Plain insert; the `records_key` constraint turns a racing duplicate
    /// into `StoreError::Conflict`.
    async fn insert(&self, record: &AttendanceRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO attendance.records
            (id, subject_id, log_date, period_number, subject_context, display_name, cohort, status, note)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.key.subject_id.as_str())
        .bind(record.key.date)
        .bind(period_to_db(record.key.period)?)
        .bind(&record.key.context)
        .bind(&record.fields.display_name)
        .bind(&record.fields.cohort)
        .bind(record.fields.status.as_str())
        .bind(record.fields.note.map(|n| n.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, key: &AttendanceKey, fields: &AttendanceFields) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE attendance.records
            SET display_name = $5, cohort = $6, status = $7, note = $8, updated_at = now()
            WHERE subject_id = $1 AND log_date = $2 AND period_number = $3 AND subject_context = $4
            "#,
        )
        .bind(key.subject_id.as_str())
        .bind(key.date)
        .bind(period_to_db(key.period)?)
        .bind(&key.context)
        .bind(&fields.display_name)
        .bind(&fields.cohort)
        .bind(fields.status.as_str())
        .bind(fields.note.map(|n| n.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "attendance record for {} on {} period {}",
                key.subject_id, key.date, key.period
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AttendanceHistory for PgStore {
    async fn records_for_context(
        &self,
        cohort: &str,
        context: &str,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance.records \
             WHERE cohort = $1 AND subject_context = $2 \
             ORDER BY log_date DESC, display_name ASC, period_number ASC"
        );
        let rows = sqlx::query(&query)
            .bind(cohort)
            .bind(context)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn records_for_cohort(&self, cohort: &str) -> StoreResult<Vec<AttendanceRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance.records \
             WHERE cohort = $1 \
             ORDER BY log_date DESC, display_name ASC, period_number ASC"
        );
        let rows = sqlx::query(&query).bind(cohort).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn records_for_subject(
        &self,
        subject_id: &SubjectId,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance.records \
             WHERE subject_id = $1 \
             ORDER BY log_date DESC, period_number ASC"
        );
        let rows = sqlx::query(&query)
            .bind(subject_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }
}

/// Deterministic placeholder descriptor so seeded cohorts can be matched
/// against hand-written recordings.
pub fn seed_descriptor(seed: u32) -> Vec<f64> {
    (0..DESCRIPTOR_DIMENSIONS as u32)
        .map(|i| {
            let bucket = (i * 37 + seed * 101) % 97;
            f64::from(bucket) / 97.0 * 0.2 - 0.1
        })
        .collect()
}

pub async fn seed(store: &PgStore) -> anyhow::Result<()> {
    let subjects = [
        ("10-A", "u-1001", "Avery Lee"),
        ("10-A", "u-1002", "Jules Moreno"),
        ("10-A", "u-1003", "Kiara Patel"),
        ("10-B", "u-2001", "Noor Haddad"),
    ];

    for (idx, (cohort, subject_id, name)) in subjects.into_iter().enumerate() {
        let subject = Subject {
            id: SubjectId::from(subject_id),
            display_name: name.to_string(),
            descriptor: seed_descriptor(idx as u32 + 1),
        };
        store
            .upsert_subject(cohort, &subject)
            .await
            .with_context(|| format!("failed to seed {subject_id}"))?;
    }

    let past_session = NaiveDate::from_ymd_opt(2024, 4, 30).context("invalid date")?;
    let history = [
        ("u-1001", "Avery Lee", AttendanceStatus::Present, None),
        ("u-1002", "Jules Moreno", AttendanceStatus::Absent, Some(Note::LowConfidence)),
        ("u-1003", "Kiara Patel", AttendanceStatus::Absent, None),
    ];

    for (subject_id, name, status, note) in history {
        let record = AttendanceRecord {
            key: AttendanceKey {
                subject_id: SubjectId::from(subject_id),
                date: past_session,
                period: 1,
                context: "Math".to_string(),
            },
            fields: AttendanceFields {
                display_name: name.to_string(),
                cohort: "10-A".to_string(),
                status,
                note,
            },
        };
        match store.insert(&record).await {
            Ok(()) | Err(StoreError::Conflict(_)) => {}
            Err(err) => return Err(err).context("failed to seed attendance history"),
        }
    }

    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
}

/// Bulk-enrolls subjects from a CSV with columns
/// `subject_id,display_name,cohort,descriptor` (descriptor as a JSON array).
pub async fn import_csv<R>(registry: &R, csv_path: &std::path::Path) -> anyhow::Result<ImportSummary>
where
    R: SubjectRegistry + ?Sized,
{
    #[derive(serde::Deserialize)]
    struct CsvRow {
        subject_id: String,
        display_name: String,
        cohort: String,
        descriptor: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut summary = ImportSummary::default();
    let mut dimensions: Option<usize> = None;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let descriptor: Vec<f64> = serde_json::from_str(&row.descriptor)
            .with_context(|| format!("row {}: descriptor is not a JSON number array", line + 1))?;

        match dimensions {
            Some(expected) if expected != descriptor.len() => anyhow::bail!(
                "row {}: descriptor has {} dimensions, expected {}",
                line + 1,
                descriptor.len(),
                expected
            ),
            _ => dimensions = Some(descriptor.len()),
        }

        let subject = Subject {
            id: SubjectId::new(row.subject_id),
            display_name: row.display_name,
            descriptor,
        };

        match registry.upsert_subject(&row.cohort, &subject).await? {
            UpsertAction::Created => summary.created += 1,
            UpsertAction::Updated => summary.updated += 1,
        }
    }

    Ok(summary)
}
