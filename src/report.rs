use std::fmt::Write;

use crate::models::{AttendanceRecord, AttendanceStatus, Note};
use crate::reconcile::WriteAction;
use crate::session::SessionReport;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSummary {
    pub subject_name: String,
    pub present: usize,
    pub absent: usize,
    pub low_confidence: usize,
}

impl StatusSummary {
    pub fn attendance_rate(&self) -> f64 {
        let total = self.present + self.absent;
        if total == 0 {
            0.0
        } else {
            self.present as f64 / total as f64
        }
    }
}

pub fn summarize_by_subject(records: &[AttendanceRecord]) -> Vec<StatusSummary> {
    let mut map: std::collections::HashMap<String, StatusSummary> =
        std::collections::HashMap::new();

    for record in records {
        let entry = map
            .entry(record.key.subject_id.to_string())
            .or_insert_with(|| StatusSummary {
                subject_name: record.fields.display_name.clone(),
                present: 0,
                absent: 0,
                low_confidence: 0,
            });
        match record.fields.status {
            AttendanceStatus::Present => entry.present += 1,
            AttendanceStatus::Absent => entry.absent += 1,
        }
        if record.fields.note == Some(Note::LowConfidence) {
            entry.low_confidence += 1;
        }
    }

    let mut summaries: Vec<StatusSummary> = map.into_values().collect();
    summaries.sort_by(|a, b| {
        a.attendance_rate()
            .partial_cmp(&b.attendance_rate())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.subject_name.cmp(&b.subject_name))
    });
    summaries
}

fn status_label(status: AttendanceStatus, note: Option<Note>) -> String {
    match note {
        Some(note) => format!("{status} ({note})"),
        None => status.to_string(),
    }
}

/// Operator-facing summary of one session, including every failed write.
pub fn build_session_report(report: &SessionReport) -> String {
    let mut output = String::new();
    let request = &report.request;
    let outcome = &report.outcome;

    let _ = writeln!(output, "# Attendance Session Report");
    let _ = writeln!(
        output,
        "{} / {} on {}, period {}",
        request.cohort, request.context, request.date, request.period
    );
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "Windows: {} of {} completed (passing threshold {}){}",
        report.windows_completed,
        report.windows,
        report.passing_threshold,
        if report.aborted { ", session aborted" } else { "" }
    );
    let _ = writeln!(
        output,
        "Frames processed: {}, empty windows: {}, dropped observations: {}",
        report.frames, report.gaps, report.invalid_observations
    );
    if !report.unmatchable.is_empty() {
        let ids: Vec<&str> = report.unmatchable.iter().map(|id| id.as_str()).collect();
        let _ = writeln!(
            output,
            "Not matchable (descriptor length differs from cohort): {}",
            ids.join(", ")
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Verdicts");

    if outcome.is_empty() {
        let _ = writeln!(output, "No subjects enrolled in this cohort.");
    } else {
        let _ = writeln!(
            output,
            "{} present, {} absent ({} low-confidence)",
            outcome.count_status(AttendanceStatus::Present),
            outcome.count_status(AttendanceStatus::Absent),
            outcome.count_low_confidence()
        );
        for verdict in outcome.iter() {
            let marks: String = verdict
                .votes
                .iter()
                .map(|v| if *v { 'x' } else { '.' })
                .collect();
            let _ = writeln!(
                output,
                "- {} ({}): {} [{}] {}/{}",
                verdict.display_name,
                verdict.subject_id,
                status_label(verdict.status, verdict.note),
                marks,
                verdict.present_count,
                report.windows
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Write-back");
    let writes = &report.writes;
    let _ = writeln!(
        output,
        "{} inserted, {} updated, {} unchanged, {} failed",
        writes.count(WriteAction::Inserted),
        writes.count(WriteAction::Updated),
        writes.count(WriteAction::Unchanged),
        writes.failed_count()
    );
    for (write, err) in writes.failures() {
        let _ = writeln!(output, "- FAILED {} ({}): {}", write.display_name, write.subject_id, err);
    }

    output
}

/// Markdown attendance log for a cohort, a subject-matter context or a single subject.
pub fn build_attendance_report(scope: &str, records: &[AttendanceRecord]) -> String {
    let summaries = summarize_by_subject(records);
    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Report");
    let _ = writeln!(output, "Generated for {scope}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Attendance by Subject");

    if summaries.is_empty() {
        let _ = writeln!(output, "No attendance recorded.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} present, {} absent ({} low-confidence), rate {:.0}%",
                summary.subject_name,
                summary.present,
                summary.absent,
                summary.low_confidence,
                summary.attendance_rate() * 100.0
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Log");

    if records.is_empty() {
        let _ = writeln!(output, "No attendance recorded.");
    } else {
        let _ = writeln!(output, "| Date | Period | Context | Cohort | Subject | Status |");
        let _ = writeln!(output, "|------|--------|---------|--------|---------|--------|");
        for record in records {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} ({}) | {} |",
                record.key.date,
                record.key.period,
                record.key.context,
                record.fields.cohort,
                record.fields.display_name,
                record.key.subject_id,
                status_label(record.fields.status, record.fields.note)
            );
        }
    }

    output
}
