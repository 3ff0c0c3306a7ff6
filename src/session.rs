use std::sync::Arc;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::models::{AttendanceStatus, SessionOutcome, SubjectId};
use crate::reconcile::{reconcile, ReconcileSummary, ReconcileTarget};
use crate::scheduler::{Detector, FrameSource, SampleScheduler};
use crate::store::{AttendanceStore, SubjectDirectory};
use crate::voting::classify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub cohort: String,
    pub context: String,
    pub period: u32,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub request: SessionRequest,
    pub windows: usize,
    pub passing_threshold: usize,
    pub windows_completed: usize,
    pub aborted: bool,
    pub frames: usize,
    pub gaps: usize,
    pub invalid_observations: usize,
    /// Enrolled subjects skipped by the matcher for a mismatched descriptor length.
    pub unmatchable: Vec<SubjectId>,
    pub outcome: SessionOutcome,
    pub writes: ReconcileSummary,
}

/// Everything one session owns: its stores, its frame source and detector.
///
/// `run_session` consumes the context, so the frame source is released when
/// the session returns, whichever way it ends.
pub struct SessionContext<S, D> {
    config: SessionConfig,
    directory: Arc<dyn SubjectDirectory>,
    store: Arc<dyn AttendanceStore>,
    source: S,
    detector: D,
    cancel: CancellationToken,
}

impl<S, D> SessionContext<S, D>
where
    S: FrameSource,
    D: Detector<S::Frame>,
{
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn SubjectDirectory>,
        store: Arc<dyn AttendanceStore>,
        source: S,
        detector: D,
    ) -> Self {
        Self {
            config,
            directory,
            store,
            source,
            detector,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle that aborts the session; windows not yet completed stay empty.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run_session(mut self, request: SessionRequest) -> Result<SessionReport, EngineError> {
        self.config.validate()?;

        let subjects = self
            .directory
            .load_subjects(&request.cohort)
            .await
            .map_err(|err| EngineError::DirectoryUnavailable {
                cohort: request.cohort.clone(),
                message: err.to_string(),
            })?;

        info!(
            cohort = %request.cohort,
            context = %request.context,
            period = request.period,
            date = %request.date,
            subjects = subjects.len(),
            windows = self.config.windows,
            "attendance session started"
        );

        let schedule = {
            let mut scheduler = SampleScheduler::new(&self.config, &subjects, &self.detector);
            scheduler.run(&mut self.source, &self.cancel).await
        };

        let outcome = classify(&schedule.votes, self.config.passing_threshold);

        let target = ReconcileTarget {
            date: request.date,
            period: request.period,
            context: request.context.clone(),
            cohort: request.cohort.clone(),
        };
        let writes = reconcile(
            self.store.as_ref(),
            &outcome,
            &target,
            self.config.max_write_attempts,
        )
        .await;

        info!(
            cohort = %request.cohort,
            present = outcome.count_status(AttendanceStatus::Present),
            absent = outcome.count_status(AttendanceStatus::Absent),
            aborted = schedule.aborted,
            failed_writes = writes.failed_count(),
            "attendance session finished"
        );

        Ok(SessionReport {
            request,
            windows: self.config.windows,
            passing_threshold: self.config.passing_threshold,
            windows_completed: schedule.windows_completed,
            aborted: schedule.aborted,
            frames: schedule.frames,
            gaps: schedule.gaps,
            invalid_observations: schedule.invalid_observations,
            unmatchable: schedule.unmatchable,
            outcome,
            writes,
        })
    }
}
