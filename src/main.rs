use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{ArgGroup, Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use cohort_attendance_voting::db::{self, PgStore};
use cohort_attendance_voting::enroll::enroll;
use cohort_attendance_voting::replay::{parse_recording, ObservationDetector, ReplaySource};
use cohort_attendance_voting::report;
use cohort_attendance_voting::store::AttendanceHistory;
use cohort_attendance_voting::{SessionConfig, SessionContext, SessionRequest, SubjectId};

#[derive(Parser)]
#[command(name = "cohort-attendance")]
#[command(about = "Multi-sample attendance voting for cohort sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Tuning {
    /// Number of sampling windows
    #[arg(long, env = "ATTENDANCE_WINDOWS", default_value_t = 5)]
    windows: usize,
    /// Length of each window in milliseconds
    #[arg(long, env = "ATTENDANCE_WINDOW_MS", default_value_t = 3_000)]
    window_ms: u64,
    /// Pause between frames in milliseconds
    #[arg(long, env = "ATTENDANCE_FRAME_MS", default_value_t = 200)]
    frame_ms: u64,
    /// Windows a subject must be seen in to be marked present
    #[arg(long, env = "ATTENDANCE_PASSING_THRESHOLD", default_value_t = 3)]
    passing_threshold: usize,
    /// Maximum descriptor distance accepted as a match
    #[arg(long, env = "ATTENDANCE_TOLERANCE", default_value_t = 0.6)]
    tolerance: f64,
    #[arg(long, env = "ATTENDANCE_WRITE_ATTEMPTS", default_value_t = 3)]
    write_attempts: u32,
}

impl From<Tuning> for SessionConfig {
    fn from(t: Tuning) -> Self {
        SessionConfig {
            windows: t.windows,
            window_duration: Duration::from_millis(t.window_ms),
            frame_interval: Duration::from_millis(t.frame_ms),
            passing_threshold: t.passing_threshold,
            tolerance: t.tolerance,
            max_write_attempts: t.write_attempts,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small demo cohort
    Seed,
    /// Enroll subjects from a CSV of precomputed descriptors
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Enroll one subject from recorded sample frames
    Enroll {
        #[arg(long)]
        cohort: String,
        #[arg(long)]
        subject_id: String,
        #[arg(long)]
        name: String,
        /// JSON-lines recording, one sample per line
        #[arg(long)]
        samples: PathBuf,
    },
    /// Run an attendance session over a recorded observation stream
    Session {
        #[arg(long)]
        cohort: String,
        /// Subject-matter context, e.g. Math
        #[arg(long)]
        context: String,
        #[arg(long)]
        period: u32,
        #[arg(long)]
        date: NaiveDate,
        /// JSON-lines recording, one frame per line
        #[arg(long)]
        replay: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
        /// Also write the session report to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate a markdown attendance report
    #[command(group(
        ArgGroup::new("scope")
            .args(["cohort", "subject_id"])
            .required(true)
            .multiple(false)
    ))]
    Report {
        #[arg(long)]
        cohort: Option<String>,
        /// Restrict a cohort report to one subject-matter context
        #[arg(long, requires = "cohort")]
        context: Option<String>,
        #[arg(long)]
        subject_id: Option<String>,
        #[arg(long, default_value = "attendance.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cohort_attendance_voting=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool.clone()));

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&store).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let summary = db::import_csv(store.as_ref(), &csv).await?;
            println!(
                "Enrolled {} new and refreshed {} existing subjects from {}.",
                summary.created,
                summary.updated,
                csv.display()
            );
        }
        Commands::Enroll {
            cohort,
            subject_id,
            name,
            samples,
        } => {
            let contents = tokio::fs::read_to_string(&samples)
                .await
                .with_context(|| format!("failed to read {}", samples.display()))?;
            let frames = parse_recording(&contents)?;
            let enrolled = enroll(
                store.as_ref(),
                &ObservationDetector,
                frames,
                &cohort,
                SubjectId::new(subject_id),
                &name,
            )
            .await?;
            println!(
                "{} saved ({:?}) from sample {}.",
                enrolled.subject.display_name, enrolled.action, enrolled.sample_index
            );
        }
        Commands::Session {
            cohort,
            context,
            period,
            date,
            replay,
            tuning,
            out,
        } => {
            let source = ReplaySource::from_path(&replay).await?;
            let session = SessionContext::new(
                tuning.into(),
                store.clone(),
                store.clone(),
                source,
                ObservationDetector,
            );

            let cancel = session.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let request = SessionRequest {
                cohort,
                context,
                period,
                date,
            };
            let result = session.run_session(request).await?;
            let text = report::build_session_report(&result);
            print!("{text}");
            if let Some(out) = out {
                std::fs::write(&out, &text)?;
                println!("Report written to {}.", out.display());
            }
        }
        Commands::Report {
            cohort,
            context,
            subject_id,
            out,
        } => {
            let (scope, records) = match (cohort, context, subject_id) {
                (Some(cohort), Some(context), _) => {
                    let records = store.records_for_context(&cohort, &context).await?;
                    (format!("{cohort} / {context}"), records)
                }
                (Some(cohort), None, _) => {
                    let records = store.records_for_cohort(&cohort).await?;
                    (cohort, records)
                }
                (None, _, Some(subject_id)) => {
                    let records = store
                        .records_for_subject(&SubjectId::new(subject_id.clone()))
                        .await?;
                    (format!("subject {subject_id}"), records)
                }
                (None, _, None) => anyhow::bail!("either --cohort or --subject-id is required"),
            };
            let report = report::build_attendance_report(&scope, &records);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
