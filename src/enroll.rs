use thiserror::Error;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::matcher::dominant_dimension;
use crate::models::{Subject, SubjectId};
use crate::scheduler::Detector;
use crate::store::{SubjectRegistry, UpsertAction};

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no sample with exactly one clear face among {examined} examined")]
    NoUsableSample { examined: usize },

    #[error("descriptor has {actual} dimensions but cohort {cohort} uses {expected}")]
    DimensionMismatch {
        cohort: String,
        expected: usize,
        actual: usize,
    },

    #[error("failed to save subject: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollReport {
    pub subject: Subject,
    pub action: UpsertAction,
    /// Index of the sample the descriptor came from, counting missing samples.
    pub sample_index: usize,
}

/// Enrolls (or re-enrolls) one subject from candidate sample images.
///
/// The first sample in which exactly one face is detected and extracts
/// cleanly provides the descriptor. `None` samples (unreadable images) are
/// skipped but still counted. The descriptor must have the same length as
/// those already enrolled in `cohort`.
pub async fn enroll<F, D, R>(
    registry: &R,
    detector: &D,
    samples: impl IntoIterator<Item = Option<F>>,
    cohort: &str,
    subject_id: SubjectId,
    display_name: &str,
) -> Result<EnrollReport, EnrollError>
where
    D: Detector<F>,
    R: SubjectRegistry + ?Sized,
{
    let mut examined = 0;
    let mut chosen = None;

    for (idx, sample) in samples.into_iter().enumerate() {
        examined += 1;
        let Some(sample) = sample else {
            debug!(sample = idx, "sample missing");
            continue;
        };
        let regions = match detector.detect(&sample) {
            Ok(regions) => regions,
            Err(err) => {
                debug!(sample = idx, error = %err, "sample skipped");
                continue;
            }
        };
        let [region] = regions.as_slice() else {
            debug!(sample = idx, faces = regions.len(), "sample skipped");
            continue;
        };
        match detector.extract(&sample, region) {
            Ok(descriptor) => {
                chosen = Some((idx, descriptor));
                break;
            }
            Err(err) => debug!(sample = idx, error = %err, "sample skipped"),
        }
    }

    let Some((sample_index, descriptor)) = chosen else {
        return Err(EnrollError::NoUsableSample { examined });
    };

    let cohort_members: Vec<Subject> = registry
        .load_subjects(cohort)
        .await?
        .into_iter()
        .filter(|existing| existing.id != subject_id)
        .collect();
    if let Some(expected) = dominant_dimension(&cohort_members) {
        if expected != descriptor.len() {
            return Err(EnrollError::DimensionMismatch {
                cohort: cohort.to_string(),
                expected,
                actual: descriptor.len(),
            });
        }
    }

    let subject = Subject {
        id: subject_id,
        display_name: display_name.to_string(),
        descriptor,
    };
    let action = registry.upsert_subject(cohort, &subject).await?;

    info!(
        subject = %subject.id,
        cohort,
        sample = sample_index,
        ?action,
        "subject enrolled"
    );

    Ok(EnrollReport {
        subject,
        action,
        sample_index,
    })
}
