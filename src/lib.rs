//! Multi-sample attendance voting for cohort sessions.
//!
//! A session samples a fixed number of timed windows, matches every detected
//! face against the cohort's enrolled descriptors, votes per window, classifies
//! each subject against a passing threshold and upserts one attendance record
//! per (subject, date, period, context).

pub mod config;
pub mod db;
pub mod enroll;
pub mod error;
pub mod matcher;
pub mod models;
pub mod reconcile;
pub mod replay;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod voting;

pub use config::SessionConfig;
pub use error::{EngineError, StoreError};
pub use models::{AttendanceStatus, MatchResult, Note, SessionOutcome, Subject, SubjectId};
pub use session::{SessionContext, SessionReport, SessionRequest};
