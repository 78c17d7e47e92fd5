use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use presence_core::{quality, FrameSample, QualityConfig, ShiftConfig};

// `#[zbus::proxy]` generates `AttendanceProxy` (async) and `AttendanceProxyBlocking`.
#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    async fn open_session(&self, device_id: &str) -> zbus::Result<String>;
    async fn push_landmarks(&self, session_id: &str, sample_json: &str) -> zbus::Result<String>;
    async fn scan(
        &self,
        session_id: &str,
        frame_path: &str,
        faces_json: &str,
    ) -> zbus::Result<String>;
    async fn close_session(&self, session_id: &str) -> zbus::Result<bool>;
    async fn enroll(&self, user: &str, label: &str, embedding_json: &str) -> zbus::Result<String>;
    async fn list_enrollments(&self, user: &str) -> zbus::Result<String>;
    async fn remove_enrollment(&self, user: &str, id: &str) -> zbus::Result<bool>;
    async fn set_shift(&self, user: &str, shift_json: &str) -> zbus::Result<()>;
    async fn get_shift(&self, user: &str) -> zbus::Result<String>;
    async fn logs_today(&self, user: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true, env = "PRESENCE_SESSION_BUS")]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score an image for spoof indicators (offline, no daemon)
    Analyze {
        image: PathBuf,
        /// Composite score a live frame must exceed
        #[arg(long, default_value_t = 55.0)]
        threshold: f32,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    #[command(flatten)]
    Daemon(DaemonCommand),
}

/// Commands served by presenced over D-Bus.
#[derive(Subcommand)]
enum DaemonCommand {
    /// Manage scan sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// Score a frame within a session and record the attendance event
    Scan {
        session: String,
        /// Frame image (any format the daemon can decode)
        frame: PathBuf,
        /// JSON file with the detector output for the frame
        #[arg(long)]
        faces: PathBuf,
    },
    /// Enroll a face embedding for a user
    Enroll {
        user: String,
        /// JSON file holding the embedding (`{"values": [...], "model_version": ...}`)
        embedding: PathBuf,
        /// Label for this enrollment (e.g., "front", "glasses")
        #[arg(short, long, default_value = "default")]
        label: String,
    },
    /// List a user's enrollments
    List { user: String },
    /// Remove an enrollment
    Remove {
        user: String,
        /// Enrollment ID to remove
        id: String,
    },
    /// Manage shifts
    #[command(subcommand)]
    Shift(ShiftCommand),
    /// Show today's attendance entries for a user
    Logs { user: String },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Open a session for a device and print its id
    Open { device: String },
    /// Push a landmark sample (JSON) into a session
    Push { session: String, sample: String },
    /// Close a session
    Close { session: String },
}

#[derive(Subcommand)]
enum ShiftCommand {
    /// Set a user's shift
    Set {
        user: String,
        /// Shift start (HH:MM or HH:MM:SS)
        #[arg(long)]
        start: String,
        /// Shift end (HH:MM or HH:MM:SS)
        #[arg(long)]
        end: String,
        /// Minutes after start before a check-in counts as late
        #[arg(long, default_value_t = 15)]
        grace: u32,
        /// Minutes after end before a check-out counts as overtime
        #[arg(long, default_value_t = 30)]
        overtime: u32,
    },
    /// Show a user's effective shift
    Get { user: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        // Offline analysis needs no bus connection.
        Commands::Analyze {
            image,
            threshold,
            json,
        } => analyze(&image, threshold, json),
        Commands::Daemon(command) => {
            let proxy = connect(cli.session_bus).await?;
            run(command, &proxy).await
        }
    }
}

async fn run(command: DaemonCommand, proxy: &AttendanceProxy<'_>) -> Result<()> {
    match command {
        DaemonCommand::Session(SessionCommand::Open { device }) => {
            println!("{}", proxy.open_session(&device).await?);
        }
        DaemonCommand::Session(SessionCommand::Push { session, sample }) => {
            print_json(&proxy.push_landmarks(&session, &sample).await?)?;
        }
        DaemonCommand::Session(SessionCommand::Close { session }) => {
            if proxy.close_session(&session).await? {
                println!("Session {session} closed");
            } else {
                println!("Session {session} was not open");
            }
        }
        DaemonCommand::Scan {
            session,
            frame,
            faces,
        } => {
            // The daemon resolves the path itself, so hand it an absolute one.
            let frame = frame
                .canonicalize()
                .with_context(|| format!("frame {}", frame.display()))?;
            let faces = read_file(&faces)?;
            let frame = frame.to_str().context("frame path is not valid UTF-8")?;
            print_json(&proxy.scan(&session, frame, &faces).await?)?;
        }
        DaemonCommand::Enroll {
            user,
            embedding,
            label,
        } => {
            let embedding = read_file(&embedding)?;
            let id = proxy.enroll(&user, &label, &embedding).await?;
            println!("Enrolled {user} ({label}): {id}");
        }
        DaemonCommand::List { user } => {
            print_json(&proxy.list_enrollments(&user).await?)?;
        }
        DaemonCommand::Remove { user, id } => {
            if proxy.remove_enrollment(&user, &id).await? {
                println!("Removed enrollment {id}");
            } else {
                bail!("no enrollment {id} for user {user}");
            }
        }
        DaemonCommand::Shift(ShiftCommand::Set {
            user,
            start,
            end,
            grace,
            overtime,
        }) => {
            let shift = build_shift(&start, &end, grace, overtime)?;
            proxy
                .set_shift(&user, &serde_json::to_string(&shift)?)
                .await?;
            println!(
                "Shift for {user}: {} to {} (grace {grace}m, overtime after {overtime}m)",
                shift.start_time, shift.end_time
            );
        }
        DaemonCommand::Shift(ShiftCommand::Get { user }) => {
            print_json(&proxy.get_shift(&user).await?)?;
        }
        DaemonCommand::Logs { user } => {
            print_json(&proxy.logs_today(&user).await?)?;
        }
        DaemonCommand::Status => {
            print_json(&proxy.status().await?)?;
        }
    }
    Ok(())
}

async fn connect(session_bus: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("presenced is not reachable")
}

fn analyze(path: &Path, threshold: f32, json: bool) -> Result<()> {
    let frame = FrameSample::open(path).with_context(|| format!("reading {}", path.display()))?;
    let config = QualityConfig {
        live_threshold: threshold,
        ..QualityConfig::default()
    };
    let report = quality::analyze(&frame, &config);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} ({}x{})", path.display(), frame.width(), frame.height());
    println!("  score:          {:.1}", report.score);
    println!("  likely live:    {}", report.is_likely_live);
    println!("  classification: {:?}", report.classification);
    println!("  texture:        {:.1}", report.signals.texture);
    println!("  moire:          {:.1}", report.signals.moire);
    println!("  brightness var: {:.1}", report.signals.brightness_variation);
    println!("  saturation:     {:.1}", report.signals.saturation);
    println!("  reflectance:    {:.1}", report.signals.reflectance);
    Ok(())
}

fn build_shift(start: &str, end: &str, grace: u32, overtime: u32) -> Result<ShiftConfig> {
    let start_time = parse_time(start)?;
    let end_time = parse_time(end)?;
    if end_time <= start_time {
        bail!("shift end {end} must be after start {start}");
    }
    Ok(ShiftConfig {
        start_time,
        end_time,
        grace_period_minutes: grace,
        overtime_threshold_minutes: overtime,
    })
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("invalid time {s:?}, expected HH:MM"))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
