use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use clap::{Parser, Subcommand};

use jobpulse::clock::Clock;
use jobpulse::config::{JobPulseConfig, LoggingConfig};
use jobpulse::job::{JobRecord, JobStatus};
use jobpulse::monitor::Monitor;
use jobpulse::registry::{self, JobDefinition};
use jobpulse::store::{JobStore, SqliteJobStore};
use jobpulse::tracker::{heartbeat_age, is_stale, HeartbeatTracker};
use jobpulse::wrapper::{self, WrapperOptions};

#[derive(Parser)]
#[command(
    name = "jobpulse",
    about = "Heartbeat and crash tracking for cron jobs and batch processes",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $JOBPULSE_CONFIG, then /etc/jobpulse/jobpulse.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the config file
    #[arg(long, global = true, env = "JOBPULSE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command, heartbeating while it runs
    Run {
        /// Job name (generated when omitted)
        #[arg(long)]
        name: Option<String>,

        /// Start even if the job is not idle
        #[arg(long)]
        force: bool,

        /// Seconds between heartbeat attempts
        #[arg(long, default_value = "1")]
        poll_secs: u64,

        /// Program and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Record a heartbeat (skipped if the last one is recent)
    Beat {
        /// Job name (generated when omitted)
        #[arg(long)]
        name: Option<String>,
    },

    /// Mark a job idle
    Stop {
        #[arg(long)]
        name: String,
    },

    /// Mark a job crashed
    Crash {
        #[arg(long)]
        name: String,
    },

    /// Show one job
    Status {
        #[arg(long)]
        name: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List all jobs
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Mark jobs with a stale heartbeat as crashed
    Monitor {
        /// Keep sweeping until interrupted
        #[arg(long)]
        watch: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Create or update a job's metadata
    Register {
        #[arg(long)]
        name: String,

        /// Command line the job runs
        #[arg(long)]
        command: Option<String>,

        /// Cron expression (5 or 6 fields)
        #[arg(long)]
        schedule: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Register the job as disabled
        #[arg(long)]
        disabled: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// Store calls are synchronous and run inline on this one thread (see `wrapper`).
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = JobPulseConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    init_tracing(&config.logging);
    tracing::debug!(?config, "configuration resolved");

    let clock = config.heartbeat.clock();
    let settings = config.heartbeat.settings();

    match cli.command {
        Commands::Run {
            name,
            force,
            poll_secs,
            command,
        } => {
            let store = jobpulse::open_store(&config)?;
            let mut tracker = HeartbeatTracker::with_clock(store, clock, settings);
            tracker.initiate(name.as_deref());

            let options = WrapperOptions {
                poll: std::time::Duration::from_secs(poll_secs.max(1)),
                allow_concurrent: force,
            };
            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("no command given"))?;
            let status = wrapper::run_wrapped(&mut tracker, program, args, &options).await?;
            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
        }
        Commands::Beat { name } => {
            let store = jobpulse::open_store(&config)?;
            let mut tracker = HeartbeatTracker::with_clock(store, clock, settings);
            tracker.initiate(name.as_deref());
            let written = tracker.heartbeat()?;
            let job = tracker.name().unwrap_or_default();
            if written {
                println!("Heartbeat recorded for '{}'.", job);
            } else {
                println!("Heartbeat for '{}' is recent; nothing written.", job);
            }
        }
        Commands::Stop { name } => {
            let store = jobpulse::open_store(&config)?;
            let mut tracker = HeartbeatTracker::with_clock(store, clock, settings);
            tracker.initiate(Some(&name));
            tracker.stop()?;
            println!("Job '{}' marked idle.", name);
        }
        Commands::Crash { name } => {
            let store = jobpulse::open_store(&config)?;
            let mut tracker = HeartbeatTracker::with_clock(store, clock, settings);
            tracker.initiate(Some(&name));
            tracker.crash()?;
            println!("Job '{}' marked crashed.", name);
        }
        Commands::Status { name, json } => {
            let store = jobpulse::open_store(&config)?;
            let Some(record) = store.find_by_name(&name)? else {
                anyhow::bail!("Job '{}' not found", name);
            };
            let view = JobView::new(&record, clock.now(), settings.crash_threshold_minutes);
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_status(&view);
            }
        }
        Commands::List { json } => {
            let store = jobpulse::open_store(&config)?;
            let now = clock.now();
            let records = store.list()?;
            let views: Vec<JobView> = records
                .iter()
                .map(|r| JobView::new(r, now, settings.crash_threshold_minutes))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else if views.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<30} | {:<8} | {:<25} | {:<6} | Enabled",
                    "Name", "Status", "Last heartbeat", "Stale"
                );
                println!("{:-<30}-|-{:-<8}-|-{:-<25}-|-{:-<6}-|-{:-<7}", "", "", "", "", "");
                for v in views {
                    println!(
                        "{:<30} | {:<8} | {:<25} | {:<6} | {}",
                        v.record.name,
                        v.record.status,
                        v.heartbeat_local.as_deref().unwrap_or("never"),
                        v.stale,
                        v.record.enabled
                    );
                }
            }
        }
        Commands::Monitor { watch, json } => {
            if watch {
                jobpulse::watch(&config).await?;
            } else {
                let store: SqliteJobStore = jobpulse::open_store(&config)?;
                let monitor = Monitor::new(store, clock, settings.crash_threshold_minutes);
                let report = monitor.sweep()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!(
                        "Checked {} job(s), {} stale, {} marked crashed.",
                        report.checked,
                        report.stale.len(),
                        report.marked_crashed.len()
                    );
                    for name in &report.marked_crashed {
                        println!(" - {}", name);
                    }
                }
            }
        }
        Commands::Register {
            name,
            command,
            schedule,
            description,
            disabled,
        } => {
            let store = jobpulse::open_store(&config)?;
            let definition = JobDefinition {
                name,
                command,
                schedule,
                description,
                enabled: !disabled,
            };
            let record = registry::register(&store, &definition)?;
            println!("Job '{}' registered.", record.name);
        }
    }

    Ok(())
}

/// A record plus what can be derived from it as of now.
#[derive(serde::Serialize)]
struct JobView<'a> {
    #[serde(flatten)]
    record: &'a JobRecord,
    heartbeat_local: Option<String>,
    heartbeat_age_secs: Option<i64>,
    stale: bool,
    next_run: Option<DateTime<Utc>>,
}

impl<'a> JobView<'a> {
    fn new(record: &'a JobRecord, now: DateTime<FixedOffset>, threshold_minutes: u32) -> Self {
        let now_utc = now.with_timezone(&Utc);
        Self {
            record,
            heartbeat_local: record
                .heartbeat_at
                .map(|hb| hb.with_timezone(now.offset()).format("%Y-%m-%d %H:%M:%S %:z").to_string()),
            heartbeat_age_secs: record
                .heartbeat_at
                .map(|hb| heartbeat_age(Some(hb), now_utc).num_seconds()),
            stale: record.status != JobStatus::Idle
                && is_stale(record.heartbeat_at, now_utc, threshold_minutes),
            next_run: record
                .schedule
                .as_deref()
                .and_then(|s| registry::next_run(s, now_utc)),
        }
    }
}

fn print_status(view: &JobView<'_>) {
    let r = view.record;
    println!("\n=== Job: {} ===", r.name);
    println!("Status:         {}", r.status);
    println!(
        "Last heartbeat: {}",
        view.heartbeat_local.as_deref().unwrap_or("never")
    );
    if let Some(age) = view.heartbeat_age_secs {
        println!("Age:            {}s", age);
    }
    println!("Stale:          {}", view.stale);
    println!("Enabled:        {}", r.enabled);
    if let Some(cmd) = &r.command {
        println!("Command:        {}", cmd);
    }
    if let Some(schedule) = &r.schedule {
        println!("Schedule:       {}", schedule);
    }
    if let Some(next) = view.next_run {
        println!("Next run:       {}", next.to_rfc3339());
    }
    if let Some(desc) = &r.description {
        println!("Description:    {}", desc);
    }
    println!();
}
