use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Opaque identifier of an enrolled subject (a student uid, for instance).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SubjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

pub type Descriptor = Vec<f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub display_name: String,
    pub descriptor: Descriptor,
}

/// Face bounding box in (top, right, bottom, left) pixel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub region: Region,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Set only when `accepted` is true.
    pub subject_id: Option<SubjectId>,
    /// Distance to the nearest known subject; infinite when nothing is enrolled.
    pub distance: f64,
    pub accepted: bool,
}

impl MatchResult {
    pub fn unmatched(distance: f64) -> Self {
        Self {
            subject_id: None,
            distance,
            accepted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PRESENT" => Ok(AttendanceStatus::Present),
            "ABSENT" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status '{other}'")),
        }
    }
}

/// Structured qualifier attached to a verdict instead of a decorated status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Note {
    /// Seen in some windows, but fewer than the passing threshold.
    LowConfidence,
}

impl Note {
    pub fn as_str(&self) -> &'static str {
        match self {
            Note::LowConfidence => "low-confidence",
        }
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Note {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low-confidence" => Ok(Note::LowConfidence),
            other => Err(format!("unknown attendance note '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub subject_id: SubjectId,
    pub display_name: String,
    pub status: AttendanceStatus,
    pub note: Option<Note>,
    pub present_count: usize,
    pub votes: Vec<bool>,
}

/// Per-subject verdicts of one session, in enrollment order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionOutcome {
    verdicts: Vec<Verdict>,
}

impl SessionOutcome {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self { verdicts }
    }

    pub fn get(&self, subject_id: &SubjectId) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| &v.subject_id == subject_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter()
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn count_status(&self, status: AttendanceStatus) -> usize {
        self.verdicts.iter().filter(|v| v.status == status).count()
    }

    pub fn count_low_confidence(&self) -> usize {
        self.verdicts
            .iter()
            .filter(|v| v.note == Some(Note::LowConfidence))
            .count()
    }
}

/// Logical key of a durable attendance record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttendanceKey {
    pub subject_id: SubjectId,
    pub date: NaiveDate,
    pub period: u32,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceFields {
    pub display_name: String,
    pub cohort: String,
    pub status: AttendanceStatus,
    pub note: Option<Note>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub key: AttendanceKey,
    pub fields: AttendanceFields,
}
