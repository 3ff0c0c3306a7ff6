//! Recorded-observation playback.
//!
//! A recording is JSON lines: each line is one frame, either an array of
//! observations (`{"region": {...}, "descriptor": [...]}`) or `null` for a
//! frame the camera failed to deliver. Blank lines are skipped.
//!
//! Regions identify observations within a frame, so a frame may not repeat one.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;

use crate::models::{Descriptor, Observation, Region};
use crate::scheduler::{Detector, FrameSource};

pub type RecordedFrame = Vec<Observation>;

pub fn parse_recording(contents: &str) -> anyhow::Result<Vec<Option<RecordedFrame>>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let frame = serde_json::from_str::<Option<RecordedFrame>>(line)
                .with_context(|| format!("invalid frame on line {}", idx + 1))?;
            if let Some(observations) = &frame {
                if let Some(region) = repeated_region(observations) {
                    bail!("line {}: region {region:?} appears more than once", idx + 1);
                }
            }
            Ok(frame)
        })
        .collect()
}

fn repeated_region(observations: &[Observation]) -> Option<Region> {
    let mut seen = HashSet::new();
    observations
        .iter()
        .map(|obs| obs.region)
        .find(|region| !seen.insert(*region))
}

/// Plays frames back in order; once exhausted every request is a gap.
#[derive(Debug, Default)]
pub struct ReplaySource {
    frames: VecDeque<Option<RecordedFrame>>,
}

impl ReplaySource {
    pub fn new(frames: Vec<Option<RecordedFrame>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read recording {}", path.display()))?;
        Ok(Self::new(parse_recording(&contents)?))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    type Frame = RecordedFrame;

    async fn next_frame(&mut self) -> Option<RecordedFrame> {
        self.frames.pop_front().flatten()
    }
}

/// Detector over frames that already carry their observations, looked up by
/// region. `parse_recording` guarantees regions are distinct within a frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObservationDetector;

impl Detector<RecordedFrame> for ObservationDetector {
    fn detect(&self, frame: &RecordedFrame) -> anyhow::Result<Vec<Region>> {
        Ok(frame.iter().map(|obs| obs.region).collect())
    }

    fn extract(&self, frame: &RecordedFrame, region: &Region) -> anyhow::Result<Descriptor> {
        frame
            .iter()
            .find(|obs| &obs.region == region)
            .map(|obs| obs.descriptor.clone())
            .ok_or_else(|| anyhow!("no observation recorded for region {region:?}"))
    }
}
