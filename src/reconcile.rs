use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::{EngineError, StoreError};
use crate::models::{
    AttendanceFields, AttendanceKey, AttendanceRecord, SessionOutcome, SubjectId,
};
use crate::store::AttendanceStore;

/// Pause before retry `n` is `n * RETRY_BACKOFF`.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Where a session's verdicts are written: the key parts shared by every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileTarget {
    pub date: NaiveDate,
    pub period: u32,
    pub context: String,
    pub cohort: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Inserted,
    Updated,
    /// The stored record already carried the same fields.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectWrite {
    pub subject_id: SubjectId,
    pub display_name: String,
    pub result: Result<WriteAction, EngineError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSummary {
    pub writes: Vec<SubjectWrite>,
}

impl ReconcileSummary {
    pub fn count(&self, action: WriteAction) -> usize {
        self.writes
            .iter()
            .filter(|w| w.result.as_ref().ok() == Some(&action))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SubjectWrite, &EngineError)> {
        self.writes
            .iter()
            .filter_map(|w| w.result.as_ref().err().map(|err| (w, err)))
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Merges every verdict of `outcome` into the store, one idempotent upsert per key.
///
/// A failed write is recorded in the summary and the remaining subjects are
/// still written.
pub async fn reconcile<S>(
    store: &S,
    outcome: &SessionOutcome,
    target: &ReconcileTarget,
    max_attempts: u32,
) -> ReconcileSummary
where
    S: AttendanceStore + ?Sized,
{
    let mut summary = ReconcileSummary::default();

    for verdict in outcome.iter() {
        let record = AttendanceRecord {
            key: AttendanceKey {
                subject_id: verdict.subject_id.clone(),
                date: target.date,
                period: target.period,
                context: target.context.clone(),
            },
            fields: AttendanceFields {
                display_name: verdict.display_name.clone(),
                cohort: target.cohort.clone(),
                status: verdict.status,
                note: verdict.note,
            },
        };

        let result = write_with_retry(store, &record, max_attempts).await;
        match &result {
            Ok(action) => debug!(
                subject = %verdict.subject_id,
                status = %verdict.status,
                ?action,
                "attendance record written"
            ),
            Err(err) => warn!(subject = %verdict.subject_id, error = %err, "attendance write failed"),
        }

        summary.writes.push(SubjectWrite {
            subject_id: verdict.subject_id.clone(),
            display_name: verdict.display_name.clone(),
            result,
        });
    }

    info!(
        cohort = %target.cohort,
        context = %target.context,
        date = %target.date,
        period = target.period,
        inserted = summary.count(WriteAction::Inserted),
        updated = summary.count(WriteAction::Updated),
        unchanged = summary.count(WriteAction::Unchanged),
        failed = summary.failed_count(),
        "reconciliation finished"
    );

    summary
}

async fn write_with_retry<S>(
    store: &S,
    record: &AttendanceRecord,
    max_attempts: u32,
) -> Result<WriteAction, EngineError>
where
    S: AttendanceStore + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match upsert(store, record).await {
            Ok(action) => return Ok(action),
            Err(StoreError::Unavailable(message)) if attempt < max_attempts => {
                warn!(
                    subject = %record.key.subject_id,
                    attempt,
                    error = %message,
                    "store unavailable, retrying write"
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(StoreError::Conflict(message)) => {
                return Err(EngineError::WriteConflict {
                    subject_id: record.key.subject_id.clone(),
                    message,
                })
            }
            Err(err) => {
                return Err(EngineError::WriteFailure {
                    subject_id: record.key.subject_id.clone(),
                    message: err.to_string(),
                })
            }
        }
    }
}

async fn upsert<S>(store: &S, record: &AttendanceRecord) -> Result<WriteAction, StoreError>
where
    S: AttendanceStore + ?Sized,
{
    match store.find(&record.key).await? {
        Some(existing) if existing.fields == record.fields => Ok(WriteAction::Unchanged),
        Some(_) => {
            store.update(&record.key, &record.fields).await?;
            Ok(WriteAction::Updated)
        }
        None => match store.insert(record).await {
            Ok(()) => Ok(WriteAction::Inserted),
            // Another writer created the key between find and insert.
            Err(StoreError::Conflict(message)) => {
                debug!(subject = %record.key.subject_id, "insert raced, falling back to update");
                store
                    .update(&record.key, &record.fields)
                    .await
                    .map_err(|err| match err {
                        StoreError::Unavailable(m) => StoreError::Unavailable(m),
                        other => StoreError::Conflict(format!(
                            "{message}; fallback update failed: {other}"
                        )),
                    })?;
                Ok(WriteAction::Updated)
            }
            Err(err) => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreResult;
    use crate::models::{AttendanceStatus, Note, Verdict};
    use crate::store::MemoryAttendanceStore;

    fn target() -> ReconcileTarget {
        ReconcileTarget {
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            period: 3,
            context: "Math".to_string(),
            cohort: "10-A".to_string(),
        }
    }

    fn verdict(id: &str, status: AttendanceStatus, note: Option<Note>) -> Verdict {
        Verdict {
            subject_id: SubjectId::from(id),
            display_name: format!("Student {id}"),
            status,
            note,
            present_count: 0,
            votes: Vec::new(),
        }
    }

    fn outcome() -> SessionOutcome {
        SessionOutcome::new(vec![
            verdict("S1", AttendanceStatus::Present, None),
            verdict("S2", AttendanceStatus::Absent, Some(Note::LowConfidence)),
        ])
    }

    fn key(id: &str) -> AttendanceKey {
        AttendanceKey {
            subject_id: SubjectId::from(id),
            date: target().date,
            period: 3,
            context: "Math".to_string(),
        }
    }

    #[tokio::test]
    async fn first_run_inserts_then_replay_is_unchanged() {
        let store = MemoryAttendanceStore::new();

        let first = reconcile(&store, &outcome(), &target(), 1).await;
        assert_eq!(first.count(WriteAction::Inserted), 2);
        assert!(first.is_clean());

        let second = reconcile(&store, &outcome(), &target(), 1).await;
        assert_eq!(second.count(WriteAction::Unchanged), 2);
        assert_eq!(store.len(), 2);

        let s1 = store.find(&key("S1")).await.unwrap().unwrap();
        assert_eq!(s1.fields.status, AttendanceStatus::Present);
        let s2 = store.find(&key("S2")).await.unwrap().unwrap();
        assert_eq!(s2.fields.note, Some(Note::LowConfidence));
    }

    #[tokio::test]
    async fn changed_verdict_updates_existing_record() {
        let store = MemoryAttendanceStore::new();
        reconcile(&store, &outcome(), &target(), 1).await;

        let rerun = SessionOutcome::new(vec![verdict("S2", AttendanceStatus::Present, None)]);
        let summary = reconcile(&store, &rerun, &target(), 1).await;

        assert_eq!(summary.count(WriteAction::Updated), 1);
        assert_eq!(store.len(), 2);
        let s2 = store.find(&key("S2")).await.unwrap().unwrap();
        assert_eq!(s2.fields.status, AttendanceStatus::Present);
        assert_eq!(s2.fields.note, None);
    }

    #[tokio::test]
    async fn concurrent_reconciles_leave_one_record_per_key() {
        let store = Arc::new(MemoryAttendanceStore::new());
        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { reconcile(store.as_ref(), &outcome(), &target(), 1).await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { reconcile(store.as_ref(), &outcome(), &target(), 1).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_clean());
        assert!(b.is_clean());
        assert_eq!(store.len(), 2);
    }

    /// Reports every key as missing so the insert always races an existing row.
    struct StaleReadStore {
        inner: MemoryAttendanceStore,
    }

    #[async_trait]
    impl AttendanceStore for StaleReadStore {
        async fn find(&self, _key: &AttendanceKey) -> StoreResult<Option<AttendanceRecord>> {
            Ok(None)
        }

        async fn insert(&self, record: &AttendanceRecord) -> StoreResult<()> {
            self.inner.insert(record).await
        }

        async fn update(&self, key: &AttendanceKey, fields: &AttendanceFields) -> StoreResult<()> {
            self.inner.update(key, fields).await
        }
    }

    #[tokio::test]
    async fn insert_conflict_falls_back_to_update() {
        let store = StaleReadStore {
            inner: MemoryAttendanceStore::new(),
        };
        reconcile(&store, &outcome(), &target(), 1).await;

        let summary = reconcile(&store, &outcome(), &target(), 1).await;
        assert_eq!(summary.count(WriteAction::Updated), 2);
        assert!(summary.is_clean());
        assert_eq!(store.inner.len(), 2);
    }

    /// Fails writes for one subject and the first `flaky` attempts overall.
    struct FaultyStore {
        inner: MemoryAttendanceStore,
        broken_subject: Option<SubjectId>,
        flaky: AtomicU32,
    }

    #[async_trait]
    impl AttendanceStore for FaultyStore {
        async fn find(&self, key: &AttendanceKey) -> StoreResult<Option<AttendanceRecord>> {
            if self
                .flaky
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.find(key).await
        }

        async fn insert(&self, record: &AttendanceRecord) -> StoreResult<()> {
            if self.broken_subject.as_ref() == Some(&record.key.subject_id) {
                return Err(StoreError::Rejected("check constraint".to_string()));
            }
            self.inner.insert(record).await
        }

        async fn update(&self, key: &AttendanceKey, fields: &AttendanceFields) -> StoreResult<()> {
            self.inner.update(key, fields).await
        }
    }

    #[tokio::test]
    async fn one_failed_subject_does_not_abort_the_batch() {
        let store = FaultyStore {
            inner: MemoryAttendanceStore::new(),
            broken_subject: Some(SubjectId::from("S1")),
            flaky: AtomicU32::new(0),
        };
        let summary = reconcile(&store, &outcome(), &target(), 1).await;

        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.count(WriteAction::Inserted), 1);
        let (write, err) = summary.failures().next().unwrap();
        assert_eq!(write.subject_id, SubjectId::from("S1"));
        assert!(matches!(err, EngineError::WriteFailure { .. }));
        assert!(store.inner.find(&key("S2")).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_is_retried_with_backoff() {
        let store = FaultyStore {
            inner: MemoryAttendanceStore::new(),
            broken_subject: None,
            flaky: AtomicU32::new(2),
        };
        let started = tokio::time::Instant::now();
        let summary = reconcile(&store, &outcome(), &target(), 3).await;

        assert!(summary.is_clean());
        assert_eq!(store.inner.len(), 2);
        // S1 waits 50ms then 100ms before its third attempt succeeds.
        assert!(started.elapsed() >= RETRY_BACKOFF * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let store = FaultyStore {
            inner: MemoryAttendanceStore::new(),
            broken_subject: None,
            flaky: AtomicU32::new(10),
        };
        let started = tokio::time::Instant::now();
        let summary = reconcile(&store, &outcome(), &target(), 2).await;

        assert_eq!(summary.failed_count(), 2);
        assert!(summary
            .failures()
            .all(|(_, err)| matches!(err, EngineError::WriteFailure { .. })));
        // One pause per subject; no pause after the final attempt.
        assert!(started.elapsed() >= RETRY_BACKOFF * 2);
        assert!(started.elapsed() < RETRY_BACKOFF * 4);
    }

    /// Reports every key as missing and refuses every update, so an insert
    /// racing an existing row has nowhere to fall back to.
    struct VanishingRowStore {
        inner: MemoryAttendanceStore,
    }

    #[async_trait]
    impl AttendanceStore for VanishingRowStore {
        async fn find(&self, _key: &AttendanceKey) -> StoreResult<Option<AttendanceRecord>> {
            Ok(None)
        }

        async fn insert(&self, record: &AttendanceRecord) -> StoreResult<()> {
            self.inner.insert(record).await
        }

        async fn update(&self, key: &AttendanceKey, _fields: &AttendanceFields) -> StoreResult<()> {
            Err(StoreError::NotFound(format!("attendance record for {}", key.subject_id)))
        }
    }

    #[tokio::test]
    async fn failed_fallback_update_is_a_write_conflict() {
        let store = VanishingRowStore {
            inner: MemoryAttendanceStore::new(),
        };
        reconcile(&store.inner, &outcome(), &target(), 1).await;

        let summary = reconcile(&store, &outcome(), &target(), 3).await;

        assert_eq!(summary.failed_count(), 2);
        let (write, err) = summary.failures().next().unwrap();
        assert_eq!(write.subject_id, SubjectId::from("S1"));
        match err {
            EngineError::WriteConflict { subject_id, message } => {
                assert_eq!(subject_id, &SubjectId::from("S1"));
                assert!(message.contains("fallback update failed"));
            }
            other => panic!("expected WriteConflict, got {other:?}"),
        }
        assert_eq!(store.inner.len(), 2);
    }
}
