use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zbus::Connection;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn submit_photo(&self, path: &str, date: &str, lecture: &str, branch: &str, year: &str) -> zbus::Result<String>;
    fn job_status(&self, id: &str) -> zbus::Result<String>;
    fn mark_present(&self, roll_number: &str, date: &str, lecture: &str) -> zbus::Result<String>;
    fn mark_absent(&self, roll_number: &str, date: &str, lecture: &str) -> zbus::Result<String>;
    fn enroll_student(&self, roll_number: &str, name: &str, branch: &str, year: &str) -> zbus::Result<()>;
    fn add_reference(&self, roll_number: &str, path: &str) -> zbus::Result<()>;
    fn import_gallery(&self, directory: &str) -> zbus::Result<String>;
    fn summary(&self, roll_number: &str) -> zbus::Result<String>;
    fn cohort_summary(&self, branch: &str, year: &str) -> zbus::Result<String>;
    fn students(&self, branch: &str, year: &str) -> zbus::Result<String>;
    fn timetable(&self, branch: &str, year: &str) -> zbus::Result<String>;
    fn schedule_lecture(&self, branch: &str, year: &str, day: &str, start: &str, subject: &str) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance from face recognition")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SlotArgs {
    /// Lecture date (YYYY-MM-DD or an RFC 3339 timestamp)
    #[arg(short, long)]
    date: String,
    /// Lecture identifier (e.g., "DSA")
    #[arg(short, long)]
    lecture: String,
}

#[derive(clap::Args)]
struct CohortArgs {
    /// Branch (e.g., "ETRX")
    #[arg(short, long)]
    branch: String,
    /// Year of study (e.g., "LY")
    #[arg(short, long)]
    year: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Take attendance for a cohort from a classroom photo
    Submit {
        /// Classroom photo
        photo: PathBuf,
        #[command(flatten)]
        slot: SlotArgs,
        #[command(flatten)]
        cohort: CohortArgs,
        /// Wait for the job to finish and print its report
        #[arg(short, long)]
        wait: bool,
    },
    /// Show the state of a submitted job
    Job {
        /// Job ID returned by `submit`
        id: String,
    },
    /// Mark a student present for a lecture
    Present {
        roll_number: String,
        #[command(flatten)]
        slot: SlotArgs,
    },
    /// Mark a student absent for a lecture
    Absent {
        roll_number: String,
        #[command(flatten)]
        slot: SlotArgs,
    },
    /// Enroll a student, optionally with reference photos
    Enroll {
        roll_number: String,
        /// Full name
        #[arg(short, long)]
        name: String,
        #[command(flatten)]
        cohort: CohortArgs,
        /// Reference photo of the student's face (repeatable)
        #[arg(short, long = "photo")]
        photos: Vec<PathBuf>,
    },
    /// Import reference photos from a directory named by roll number
    Import {
        directory: PathBuf,
    },
    /// Attendance summary for one student
    Summary {
        roll_number: String,
    },
    /// Attendance summaries for a whole cohort
    Cohort {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// List enrolled students
    Students {
        #[arg(short, long, requires = "year")]
        branch: Option<String>,
        #[arg(short, long, requires = "branch")]
        year: Option<String>,
    },
    /// Show a cohort's weekly timetable
    Timetable {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Add or replace a lecture in a cohort's weekly timetable
    Schedule {
        #[command(flatten)]
        cohort: CohortArgs,
        /// Weekday (e.g., "Mon")
        #[arg(long)]
        day: String,
        /// Start time (HH:MM, or an hour such as 11)
        #[arg(short, long)]
        start: String,
        /// Subject, used as the lecture identifier when taking attendance
        #[arg(long)]
        subject: String,
    },
    /// Show daemon status
    Status,
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        Connection::system().await
    } else {
        Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Submit {
            photo,
            slot,
            cohort,
            wait,
        } => {
            let path = absolute(&photo)?;
            let id = proxy
                .submit_photo(&path, &slot.date, &slot.lecture, &cohort.branch, &cohort.year)
                .await?;
            if !wait {
                println!("{id}");
                return Ok(());
            }
            tracing::debug!(job = %id, "waiting for job");
            loop {
                let state: serde_json::Value = serde_json::from_str(&proxy.job_status(&id).await?)?;
                match state["state"].as_str() {
                    Some("pending") => tokio::time::sleep(POLL_INTERVAL).await,
                    Some("failed") => bail!("job {id} failed: {}", state["reason"]),
                    _ => {
                        print_json(&state)?;
                        break;
                    }
                }
            }
        }
        Commands::Job { id } => print_raw(&proxy.job_status(&id).await?)?,
        Commands::Present { roll_number, slot } => {
            print_raw(&proxy.mark_present(&roll_number, &slot.date, &slot.lecture).await?)?
        }
        Commands::Absent { roll_number, slot } => {
            print_raw(&proxy.mark_absent(&roll_number, &slot.date, &slot.lecture).await?)?
        }
        Commands::Enroll {
            roll_number,
            name,
            cohort,
            photos,
        } => {
            proxy
                .enroll_student(&roll_number, &name, &cohort.branch, &cohort.year)
                .await?;
            println!("Enrolled {roll_number} ({name})");
            for photo in photos {
                let path = absolute(&photo)?;
                proxy
                    .add_reference(&roll_number, &path)
                    .await
                    .with_context(|| format!("adding reference {path}"))?;
                println!("Added reference {path}");
            }
        }
        Commands::Import { directory } => print_raw(&proxy.import_gallery(&absolute(&directory)?).await?)?,
        Commands::Summary { roll_number } => print_raw(&proxy.summary(&roll_number).await?)?,
        Commands::Cohort { cohort } => print_raw(&proxy.cohort_summary(&cohort.branch, &cohort.year).await?)?,
        Commands::Students { branch, year } => print_raw(
            &proxy
                .students(&branch.unwrap_or_default(), &year.unwrap_or_default())
                .await?,
        )?,
        Commands::Timetable { cohort } => print_raw(&proxy.timetable(&cohort.branch, &cohort.year).await?)?,
        Commands::Schedule {
            cohort,
            day,
            start,
            subject,
        } => {
            proxy
                .schedule_lecture(&cohort.branch, &cohort.year, &day, &start, &subject)
                .await?;
            println!("Scheduled {subject} on {day} at {start} for {}/{}", cohort.year, cohort.branch);
        }
        Commands::Status => print_raw(&proxy.status().await?)?,
    }

    Ok(())
}

/// The daemon resolves paths against its own working directory, so send absolute ones.
fn absolute(path: &Path) -> Result<String> {
    let resolved = std::fs::canonicalize(path).with_context(|| format!("{} not found", path.display()))?;
    match resolved.to_str() {
        Some(s) => Ok(s.to_string()),
        None => bail!("{} is not valid UTF-8", resolved.display()),
    }
}

fn print_raw(json: &str) -> Result<()> {
    print_json(&serde_json::from_str(json)?)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
