use std::collections::HashMap;

use crate::error::EngineError;
use crate::models::{MatchResult, Subject};

/// Descriptor length shared by most of `subjects`; ties go to the length seen first.
pub fn dominant_dimension(subjects: &[Subject]) -> Option<usize> {
    let mut counts: HashMap<usize, (usize, usize)> = HashMap::new();
    for (idx, subject) in subjects.iter().enumerate() {
        let entry = counts.entry(subject.descriptor.len()).or_insert((0, idx));
        entry.0 += 1;
    }

    counts
        .into_iter()
        .filter(|(len, _)| *len > 0)
        .max_by(|(_, (a_count, a_first)), (_, (b_count, b_first))| {
            a_count.cmp(b_count).then_with(|| b_first.cmp(a_first))
        })
        .map(|(len, _)| len)
}

/// Splits enrolled subjects into those sharing the dominant descriptor length
/// and those that cannot be compared against the rest of the cohort.
pub fn partition_by_dimension(subjects: Vec<Subject>) -> (Vec<Subject>, Vec<Subject>) {
    let Some(dimension) = dominant_dimension(&subjects) else {
        return (Vec::new(), subjects);
    };
    subjects
        .into_iter()
        .partition(|subject| subject.descriptor.len() == dimension)
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> Result<f64, EngineError> {
    if a.len() != b.len() {
        return Err(EngineError::InvalidDescriptor {
            expected: b.len(),
            actual: a.len(),
        });
    }

    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt())
}

/// Finds the known subject nearest to `descriptor` and applies `tolerance`.
///
/// Ties on the minimal distance go to the subject that appears first in
/// `known`, i.e. enrollment order as returned by the directory.
pub fn match_descriptor(
    descriptor: &[f64],
    known: &[Subject],
    tolerance: f64,
) -> Result<MatchResult, EngineError> {
    let mut best: Option<(&Subject, f64)> = None;

    for subject in known {
        let distance = euclidean_distance(descriptor, &subject.descriptor)?;
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((subject, distance)),
        }
    }

    let Some((subject, distance)) = best else {
        return Ok(MatchResult::unmatched(f64::INFINITY));
    };

    if distance <= tolerance {
        Ok(MatchResult {
            subject_id: Some(subject.id.clone()),
            distance,
            accepted: true,
        })
    } else {
        Ok(MatchResult::unmatched(distance))
    }
}
