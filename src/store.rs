//! Store seams consumed by the engine.
//!
//! - `SubjectDirectory`: loads the enrolled subjects of a cohort (read-only).
//! - `SubjectRegistry`: creates or refreshes an enrolled subject.
//! - `AttendanceStore`: keyed find/insert/update of durable attendance records.
//! - `AttendanceHistory`: read queries behind the attendance reports.
//!
//! Postgres implementations live in `db`; the in-memory ones below back the
//! tests and replay sessions.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::models::{AttendanceFields, AttendanceKey, AttendanceRecord, Subject, SubjectId};

#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    /// Subjects enrolled in `cohort`, in enrollment order. May be empty.
    async fn load_subjects(&self, cohort: &str) -> StoreResult<Vec<Subject>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
}

/// A subject belongs to one cohort at a time; upserting an enrolled subject
/// under another cohort moves it there.
#[async_trait]
pub trait SubjectRegistry: SubjectDirectory {
    async fn upsert_subject(&self, cohort: &str, subject: &Subject) -> StoreResult<UpsertAction>;
}

/// Durable attendance log keyed by (subject, date, period, context).
///
/// `insert` must fail with `StoreError::Conflict` when the key already exists;
/// that uniqueness check is what keeps one record per key.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn find(&self, key: &AttendanceKey) -> StoreResult<Option<AttendanceRecord>>;

    async fn insert(&self, record: &AttendanceRecord) -> StoreResult<()>;

    async fn update(&self, key: &AttendanceKey, fields: &AttendanceFields) -> StoreResult<()>;
}

#[async_trait]
pub trait AttendanceHistory: Send + Sync {
    /// Records for one cohort and subject-matter context, newest first.
    async fn records_for_context(
        &self,
        cohort: &str,
        context: &str,
    ) -> StoreResult<Vec<AttendanceRecord>>;

    /// Records for a whole cohort, newest first then by display name.
    async fn records_for_cohort(&self, cohort: &str) -> StoreResult<Vec<AttendanceRecord>>;

    /// Records of one subject across cohorts, newest first.
    async fn records_for_subject(&self, subject_id: &SubjectId)
        -> StoreResult<Vec<AttendanceRecord>>;
}

fn lock<T>(mutex: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
}

/// Subjects in enrollment order, each tagged with its current cohort.
#[derive(Debug, Default)]
pub struct MemorySubjectDirectory {
    subjects: Mutex<Vec<(String, Subject)>>,
}

impl MemorySubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cohort(cohort: &str, subjects: Vec<Subject>) -> Self {
        let directory = Self::new();
        if let Ok(mut enrolled) = directory.subjects.lock() {
            enrolled.extend(subjects.into_iter().map(|s| (cohort.to_string(), s)));
        }
        directory
    }
}

#[async_trait]
impl SubjectDirectory for MemorySubjectDirectory {
    async fn load_subjects(&self, cohort: &str) -> StoreResult<Vec<Subject>> {
        let enrolled = lock(&self.subjects)?;
        Ok(enrolled
            .iter()
            .filter(|(member_of, _)| member_of == cohort)
            .map(|(_, subject)| subject.clone())
            .collect())
    }
}

#[async_trait]
impl SubjectRegistry for MemorySubjectDirectory {
    async fn upsert_subject(&self, cohort: &str, subject: &Subject) -> StoreResult<UpsertAction> {
        let mut enrolled = lock(&self.subjects)?;

        match enrolled.iter_mut().find(|(_, existing)| existing.id == subject.id) {
            Some(entry) => {
                *entry = (cohort.to_string(), subject.clone());
                Ok(UpsertAction::Updated)
            }
            None => {
                enrolled.push((cohort.to_string(), subject.clone()));
                Ok(UpsertAction::Created)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryAttendanceStore {
    records: Mutex<BTreeMap<AttendanceKey, AttendanceFields>>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect<F>(&self, filter: F) -> StoreResult<Vec<AttendanceRecord>>
    where
        F: Fn(&AttendanceKey, &AttendanceFields) -> bool,
    {
        let records = lock(&self.records)?;
        let mut matched: Vec<AttendanceRecord> = records
            .iter()
            .filter(|(key, fields)| filter(key, fields))
            .map(|(key, fields)| AttendanceRecord {
                key: key.clone(),
                fields: fields.clone(),
            })
            .collect();

        matched.sort_by(|a, b| {
            b.key
                .date
                .cmp(&a.key.date)
                .then_with(|| a.fields.display_name.cmp(&b.fields.display_name))
                .then_with(|| a.key.period.cmp(&b.key.period))
        });
        Ok(matched)
    }
}

#[async_trait]
impl AttendanceStore for MemoryAttendanceStore {
    async fn find(&self, key: &AttendanceKey) -> StoreResult<Option<AttendanceRecord>> {
        let records = lock(&self.records)?;
        Ok(records.get(key).map(|fields| AttendanceRecord {
            key: key.clone(),
            fields: fields.clone(),
        }))
    }

    async fn insert(&self, record: &AttendanceRecord) -> StoreResult<()> {
        let mut records = lock(&self.records)?;
        if records.contains_key(&record.key) {
            return Err(StoreError::Conflict(format!(
                "attendance record for {} on {} period {} ({}) already exists",
                record.key.subject_id, record.key.date, record.key.period, record.key.context
            )));
        }
        records.insert(record.key.clone(), record.fields.clone());
        Ok(())
    }

    async fn update(&self, key: &AttendanceKey, fields: &AttendanceFields) -> StoreResult<()> {
        let mut records = lock(&self.records)?;
        match records.get_mut(key) {
            Some(existing) => {
                *existing = fields.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "attendance record for {} on {}",
                key.subject_id, key.date
            ))),
        }
    }
}

#[async_trait]
impl AttendanceHistory for MemoryAttendanceStore {
    async fn records_for_context(
        &self,
        cohort: &str,
        context: &str,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        self.collect(|key, fields| fields.cohort == cohort && key.context == context)
    }

    async fn records_for_cohort(&self, cohort: &str) -> StoreResult<Vec<AttendanceRecord>> {
        self.collect(|_, fields| fields.cohort == cohort)
    }

    async fn records_for_subject(
        &self,
        subject_id: &SubjectId,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        self.collect(|key, _| &key.subject_id == subject_id)
    }
}
