use std::collections::HashMap;

use crate::models::{AttendanceStatus, Note, SessionOutcome, Subject, SubjectId, Verdict};

#[derive(Debug, Clone)]
struct VoteEntry {
    subject_id: SubjectId,
    display_name: String,
    votes: Vec<bool>,
}

/// Per-subject presence votes, one slot per sampling window.
#[derive(Debug, Clone)]
pub struct VoteVector {
    windows: usize,
    entries: Vec<VoteEntry>,
    index: HashMap<SubjectId, usize>,
}

impl VoteVector {
    pub fn new(subjects: &[Subject], windows: usize) -> Self {
        let mut entries = Vec::with_capacity(subjects.len());
        let mut index = HashMap::with_capacity(subjects.len());

        for subject in subjects {
            if index.contains_key(&subject.id) {
                continue;
            }
            index.insert(subject.id.clone(), entries.len());
            entries.push(VoteEntry {
                subject_id: subject.id.clone(),
                display_name: subject.display_name.clone(),
                votes: vec![false; windows],
            });
        }

        Self {
            windows,
            entries,
            index,
        }
    }

    pub fn windows(&self) -> usize {
        self.windows
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sets the slot for `window`. Returns false for unknown subjects or out-of-range windows.
    pub fn mark(&mut self, subject_id: &SubjectId, window: usize) -> bool {
        let Some(&idx) = self.index.get(subject_id) else {
            return false;
        };
        match self.entries[idx].votes.get_mut(window) {
            Some(slot) => {
                *slot = true;
                true
            }
            None => false,
        }
    }

    pub fn votes(&self, subject_id: &SubjectId) -> Option<&[bool]> {
        self.index
            .get(subject_id)
            .map(|&idx| self.entries[idx].votes.as_slice())
    }

    pub fn present_count(&self, subject_id: &SubjectId) -> usize {
        self.votes(subject_id)
            .map(|votes| votes.iter().filter(|v| **v).count())
            .unwrap_or(0)
    }
}

/// Folds the final vote vector into one verdict per subject.
///
/// A vector with zero windows classifies everyone as absent without a note,
/// whatever the threshold.
pub fn classify(votes: &VoteVector, passing_threshold: usize) -> SessionOutcome {
    let verdicts = votes
        .entries
        .iter()
        .map(|entry| {
            let present_count = entry.votes.iter().filter(|v| **v).count();
            let (status, note) = if votes.windows == 0 {
                (AttendanceStatus::Absent, None)
            } else if present_count >= passing_threshold {
                (AttendanceStatus::Present, None)
            } else if present_count > 0 {
                (AttendanceStatus::Absent, Some(Note::LowConfidence))
            } else {
                (AttendanceStatus::Absent, None)
            };

            Verdict {
                subject_id: entry.subject_id.clone(),
                display_name: entry.display_name.clone(),
                status,
                note,
                present_count,
                votes: entry.votes.clone(),
            }
        })
        .collect();

    SessionOutcome::new(verdicts)
}
