use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::matcher::{match_descriptor, partition_by_dimension};
use crate::models::{Descriptor, Region, Subject, SubjectId};
use crate::voting::VoteVector;

const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// Supplier of raw frames (a camera, a recording).
#[async_trait]
pub trait FrameSource: Send {
    type Frame: Send + Sync;

    /// Returns `None` when no frame is available right now. That is a gap,
    /// not the end of the session.
    async fn next_frame(&mut self) -> Option<Self::Frame>;
}

/// Face detector and descriptor extractor for frames of type `F`.
pub trait Detector<F>: Send + Sync {
    fn detect(&self, frame: &F) -> anyhow::Result<Vec<Region>>;

    fn extract(&self, frame: &F, region: &Region) -> anyhow::Result<Descriptor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Waiting(usize),
    Capturing(usize),
    Done,
}

#[derive(Debug, Clone)]
pub struct ScheduleReport {
    pub votes: VoteVector,
    /// Windows whose capture phase ran to the end.
    pub windows_completed: usize,
    pub aborted: bool,
    pub frames: usize,
    pub gaps: usize,
    pub invalid_observations: usize,
    /// Enrolled subjects whose descriptor length differs from the rest of the cohort.
    pub unmatchable: Vec<SubjectId>,
}

enum WindowCapture {
    /// Accepted subjects of the last frame processed, `None` if no frame arrived.
    Completed(Option<BTreeSet<SubjectId>>),
    Aborted,
}

#[derive(Default)]
struct Counters {
    frames: usize,
    invalid_observations: usize,
}

/// Drives the fixed sequence of sampling windows for one session.
pub struct SampleScheduler<'a, D> {
    config: &'a SessionConfig,
    subjects: &'a [Subject],
    /// Subjects the matcher compares against; all share one descriptor length.
    matchable: Vec<Subject>,
    unmatchable: Vec<SubjectId>,
    detector: &'a D,
    state: SchedulerState,
}

impl<'a, D> SampleScheduler<'a, D> {
    pub fn new(config: &'a SessionConfig, subjects: &'a [Subject], detector: &'a D) -> Self {
        let (matchable, dropped) = partition_by_dimension(subjects.to_vec());
        for subject in &dropped {
            warn!(
                subject = %subject.id,
                dimensions = subject.descriptor.len(),
                "enrolled descriptor does not match the cohort, subject cannot be matched"
            );
        }

        Self {
            config,
            subjects,
            matchable,
            unmatchable: dropped.into_iter().map(|s| s.id).collect(),
            detector,
            state: SchedulerState::Waiting(0),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub async fn run<S>(&mut self, source: &mut S, cancel: &CancellationToken) -> ScheduleReport
    where
        S: FrameSource,
        D: Detector<S::Frame>,
    {
        let mut votes = VoteVector::new(self.subjects, self.config.windows);
        let mut counters = Counters::default();
        let mut windows_completed = 0;
        let mut gaps = 0;
        let mut aborted = false;

        for window in 0..self.config.windows {
            self.state = SchedulerState::Capturing(window);

            match self.capture_window(window, source, cancel, &mut counters).await {
                WindowCapture::Completed(Some(seen)) => {
                    for subject_id in &seen {
                        votes.mark(subject_id, window);
                    }
                    debug!(window, present = seen.len(), "window committed");
                }
                WindowCapture::Completed(None) => {
                    gaps += 1;
                    let gap = EngineError::AcquisitionGap { window };
                    warn!(error = %gap, "window counted as a miss");
                }
                WindowCapture::Aborted => {
                    info!(window, "session aborted, remaining windows left empty");
                    aborted = true;
                    break;
                }
            }

            windows_completed += 1;
            self.state = SchedulerState::Waiting(window + 1);
        }

        self.state = SchedulerState::Done;

        ScheduleReport {
            votes,
            windows_completed,
            aborted,
            frames: counters.frames,
            gaps,
            invalid_observations: counters.invalid_observations,
            unmatchable: self.unmatchable.clone(),
        }
    }

    async fn capture_window<S>(
        &self,
        window: usize,
        source: &mut S,
        cancel: &CancellationToken,
        counters: &mut Counters,
    ) -> WindowCapture
    where
        S: FrameSource,
        D: Detector<S::Frame>,
    {
        let deadline = Instant::now() + self.config.window_duration;
        let mut ticker = interval(self.config.frame_interval.max(MIN_FRAME_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_seen: Option<BTreeSet<SubjectId>> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WindowCapture::Aborted,
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    let acquired = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return WindowCapture::Aborted,
                        frame = timeout_at(deadline, source.next_frame()) => frame,
                    };

                    match acquired {
                        Ok(Some(frame)) => {
                            counters.frames += 1;
                            last_seen = Some(self.accepted_subjects(&frame, window, counters));
                        }
                        Ok(None) => debug!(window, "frame unavailable"),
                        Err(_) => break,
                    }
                }
            }
        }

        WindowCapture::Completed(last_seen)
    }

    /// Matches every detected face; several faces resolving to one subject count once.
    fn accepted_subjects<F>(
        &self,
        frame: &F,
        window: usize,
        counters: &mut Counters,
    ) -> BTreeSet<SubjectId>
    where
        D: Detector<F>,
    {
        let mut seen = BTreeSet::new();

        let regions = match self.detector.detect(frame) {
            Ok(regions) => regions,
            Err(err) => {
                debug!(window, error = %err, "detection failed, frame has no observations");
                return seen;
            }
        };

        for region in &regions {
            let descriptor = match self.detector.extract(frame, region) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    debug!(window, error = %err, "descriptor extraction failed");
                    continue;
                }
            };

            match match_descriptor(&descriptor, &self.matchable, self.config.tolerance) {
                Ok(result) => {
                    if let Some(subject_id) = result.subject_id {
                        seen.insert(subject_id);
                    }
                }
                Err(err) => {
                    counters.invalid_observations += 1;
                    debug!(window, error = %err, "observation dropped");
                }
            }
        }

        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Observation;
    use crate::replay::{ObservationDetector, RecordedFrame};

    fn subject(id: &str, descriptor: Vec<f64>) -> Subject {
        Subject {
            id: SubjectId::from(id),
            display_name: id.to_string(),
            descriptor,
        }
    }

    fn observation(x: u32, descriptor: Vec<f64>) -> Observation {
        Observation {
            region: Region {
                top: 0,
                right: x + 10,
                bottom: 10,
                left: x,
            },
            descriptor,
        }
    }

    fn config(windows: usize) -> SessionConfig {
        SessionConfig {
            windows,
            window_duration: Duration::from_secs(3),
            frame_interval: Duration::from_millis(200),
            passing_threshold: 0,
            ..SessionConfig::default()
        }
    }

    /// Yields frames computed from virtual time elapsed since the source was created.
    struct ClockSource<F> {
        started: Instant,
        script: F,
    }

    impl<F> ClockSource<F>
    where
        F: Fn(Duration) -> Option<RecordedFrame> + Send,
    {
        fn new(script: F) -> Self {
            Self {
                started: Instant::now(),
                script,
            }
        }
    }

    #[async_trait]
    impl<F> FrameSource for ClockSource<F>
    where
        F: Fn(Duration) -> Option<RecordedFrame> + Send,
    {
        type Frame = RecordedFrame;

        async fn next_frame(&mut self) -> Option<RecordedFrame> {
            (self.script)(self.started.elapsed())
        }
    }

    fn known() -> Vec<Subject> {
        vec![subject("s1", vec![0.0, 0.0]), subject("s2", vec![5.0, 5.0])]
    }

    #[tokio::test(start_paused = true)]
    async fn votes_follow_window_schedule() {
        let subjects = known();
        let config = config(5);
        let detector = ObservationDetector;
        // s1 visible in windows 0 and 2, s2 in window 1.
        let mut source = ClockSource::new(|elapsed: Duration| {
            let frame = match elapsed.as_secs() / 3 {
                0 | 2 => vec![observation(0, vec![0.1, 0.0])],
                1 => vec![observation(0, vec![5.0, 5.1])],
                _ => Vec::new(),
            };
            Some(frame)
        });

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &CancellationToken::new()).await;

        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert!(!report.aborted);
        assert_eq!(report.windows_completed, 5);
        assert_eq!(
            report.votes.votes(&SubjectId::from("s1")),
            Some(&[true, false, true, false, false][..])
        );
        assert_eq!(
            report.votes.votes(&SubjectId::from("s2")),
            Some(&[false, true, false, false, false][..])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_last_frame_of_window_counts() {
        let subjects = known();
        let config = config(1);
        let detector = ObservationDetector;
        let mut source = ClockSource::new(|elapsed: Duration| {
            if elapsed < Duration::from_secs(2) {
                Some(vec![observation(0, vec![0.0, 0.0])])
            } else {
                Some(Vec::new())
            }
        });

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &CancellationToken::new()).await;

        assert_eq!(report.votes.present_count(&SubjectId::from("s1")), 0);
        assert!(report.frames > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_frames_are_misses() {
        let subjects = known();
        let config = config(3);
        let detector = ObservationDetector;
        let mut source = ClockSource::new(|_| None);

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &CancellationToken::new()).await;

        assert_eq!(report.gaps, 3);
        assert_eq!(report.frames, 0);
        assert_eq!(report.votes.present_count(&SubjectId::from("s1")), 0);
        assert_eq!(report.votes.present_count(&SubjectId::from("s2")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_faces_collapse_to_one_vote() {
        let subjects = known();
        let config = config(2);
        let detector = ObservationDetector;
        let mut source = ClockSource::new(|_| {
            Some(vec![
                observation(0, vec![0.0, 0.1]),
                observation(50, vec![0.1, 0.0]),
            ])
        });

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &CancellationToken::new()).await;

        assert_eq!(
            report.votes.votes(&SubjectId::from("s1")),
            Some(&[true, true][..])
        );
        assert_eq!(report.votes.present_count(&SubjectId::from("s1")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_descriptor_is_dropped() {
        let subjects = known();
        let config = config(1);
        let detector = ObservationDetector;
        let mut source = ClockSource::new(|_| {
            Some(vec![
                observation(0, vec![0.0, 0.0, 0.0]),
                observation(50, vec![5.0, 5.0]),
            ])
        });

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &CancellationToken::new()).await;

        assert!(report.invalid_observations > 0);
        assert_eq!(report.votes.present_count(&SubjectId::from("s1")), 0);
        assert_eq!(report.votes.present_count(&SubjectId::from("s2")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_keeps_completed_windows() {
        let subjects = known();
        let config = config(5);
        let detector = ObservationDetector;
        let mut source = ClockSource::new(|_| Some(vec![observation(0, vec![0.0, 0.0])]));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4_500)).await;
            trigger.cancel();
        });

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &cancel).await;

        assert!(report.aborted);
        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert_eq!(report.windows_completed, 1);
        assert_eq!(
            report.votes.votes(&SubjectId::from("s1")),
            Some(&[true, false, false, false, false][..])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_enrollment_does_not_block_the_cohort() {
        let subjects = vec![
            subject("bad", vec![0.0, 0.0, 0.0]),
            subject("s1", vec![0.0, 0.0]),
            subject("s2", vec![5.0, 5.0]),
        ];
        let config = config(2);
        let detector = ObservationDetector;
        let mut source = ClockSource::new(|_| Some(vec![observation(0, vec![0.0, 0.01])]));

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &CancellationToken::new()).await;

        assert_eq!(report.unmatchable, vec![SubjectId::from("bad")]);
        assert_eq!(report.invalid_observations, 0);
        assert_eq!(report.votes.present_count(&SubjectId::from("s1")), 2);
        assert_eq!(report.votes.votes(&SubjectId::from("bad")), Some(&[false, false][..]));
    }

    /// Fails detection on frames without faces, as a detector that throws on dark frames.
    struct DarkFrameDetector;

    impl Detector<RecordedFrame> for DarkFrameDetector {
        fn detect(&self, frame: &RecordedFrame) -> anyhow::Result<Vec<Region>> {
            if frame.is_empty() {
                anyhow::bail!("frame too dark");
            }
            ObservationDetector.detect(frame)
        }

        fn extract(&self, frame: &RecordedFrame, region: &Region) -> anyhow::Result<Descriptor> {
            ObservationDetector.extract(frame, region)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_detection_is_an_empty_last_frame() {
        let subjects = known();
        let config = config(1);
        let detector = DarkFrameDetector;
        let mut source = ClockSource::new(|elapsed: Duration| {
            if elapsed < Duration::from_secs(2) {
                Some(vec![observation(0, vec![0.0, 0.0])])
            } else {
                Some(Vec::new())
            }
        });

        let mut scheduler = SampleScheduler::new(&config, &subjects, &detector);
        let report = scheduler.run(&mut source, &CancellationToken::new()).await;

        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert_eq!(report.gaps, 0);
        assert!(report.frames > 1);
        assert_eq!(report.votes.present_count(&SubjectId::from("s1")), 0);
    }
}
