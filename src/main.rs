use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod config;
mod db;
mod error;
mod escalation;
mod ingest;
mod memory;
mod models;
mod report;
mod standing;
mod status;
mod store;
mod streak;

use crate::config::{load_config, EngineConfig};
use crate::db::PgStore;
use crate::escalation::{LogDispatcher, Transition};
use crate::memory::InMemoryStore;
use crate::models::{Gathering, Outcome, RecordAttendance};
use crate::status::{RequestContext, StatusService};

#[derive(Parser)]
#[command(name = "caregroup-attendance")]
#[command(about = "Attendance standing and follow-up escalation for caregroups", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import attendance rows from a check-in CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record one member's outcome for a gathering
    Record {
        #[arg(long)]
        member: Uuid,
        #[arg(long)]
        gathering: Uuid,
        /// PRESENT, ABSENT or EXCUSED
        #[arg(long)]
        outcome: String,
        /// Defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Close a gathering and mark everyone without a check-in absent
    Finalize {
        #[arg(long)]
        gathering: Uuid,
    },
    /// Show a member's attendance status
    Status {
        #[arg(long)]
        member: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Acknowledge a member's open follow-up as their leader
    Acknowledge {
        #[arg(long)]
        member: Uuid,
    },
    /// Re-send leader notifications that were never delivered
    Redeliver,
    /// Generate a markdown report for a caregroup
    Report {
        #[arg(long)]
        group: Uuid,
        #[arg(long, default_value = "attendance-report.md")]
        out: PathBuf,
    },
    /// Create a caregroup, optionally led by an enrolled member
    AddGroup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        leader: Option<Uuid>,
    },
    /// Enroll a member
    Enroll {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        group: Option<Uuid>,
    },
    /// Move a member to another caregroup, or out of any with no --group
    Assign {
        #[arg(long)]
        member: Uuid,
        #[arg(long)]
        group: Option<Uuid>,
    },
    /// Deactivate a member; their history is kept
    Deactivate {
        #[arg(long)]
        member: Uuid,
    },
    /// Schedule a gathering
    Schedule {
        #[arg(long)]
        title: String,
        /// Start time, e.g. 2026-02-01T10:00:00Z
        #[arg(long)]
        at: DateTime<Utc>,
    },
    /// Run the seed data against an in-memory store and print the roster
    Demo,
}

fn initialize_tracing() {
    let default_directives = "caregroup_attendance=info,sqlx=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
}

async fn postgres_service(config: &EngineConfig) -> anyhow::Result<(PgStore, StatusService)> {
    let settings = config.settings()?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let store = PgStore::connect(database_url, config.max_connections, settings.store_timeout)
        .await
        .context("failed to connect to Postgres")?;
    let service = StatusService::new(Arc::new(store.clone()), Arc::new(LogDispatcher), settings);
    Ok((store, service))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_tracing();
    let cli = Cli::parse();
    let config = load_config().context("failed to load configuration")?;

    match cli.command {
        Commands::Demo => run_demo(&config).await,
        command => run(command, &config).await,
    }
}

async fn run(command: Commands, config: &EngineConfig) -> anyhow::Result<()> {
    let (pg, service) = postgres_service(config).await?;
    let store = service.store();

    match command {
        Commands::InitDb => {
            pg.init_db().await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let group_id = ingest::seed(&service).await?;
            println!("Seed data inserted for caregroup {group_id}.");
        }
        Commands::Import { csv } => {
            let summary = ingest::import_csv(&service, &csv).await?;
            println!(
                "Recorded {} rows ({} skipped) from {}.",
                summary.recorded,
                summary.skipped,
                csv.display()
            );
        }
        Commands::Record {
            member,
            gathering,
            outcome,
            at,
        } => {
            let outcome: Outcome = outcome.parse()?;
            let evaluation = service
                .record_attendance(RecordAttendance {
                    member_id: member,
                    gathering_id: gathering,
                    outcome,
                    recorded_at: at.unwrap_or_else(Utc::now),
                })
                .await?;
            println!(
                "Recorded {outcome}. Streak {} ({}).",
                evaluation.streak.absences,
                evaluation.tier.label()
            );
            match evaluation.transition {
                Transition::Opened(record) => {
                    println!("Escalation {} opened; leader notified.", record.id)
                }
                Transition::Closed(record) => println!("Escalation {} resolved.", record.id),
                Transition::AlreadyOpen | Transition::Unchanged => {}
            }
        }
        Commands::Finalize { gathering } => {
            let outcome = service.finalize_gathering(gathering).await?;
            println!(
                "Gathering finalized: {} marked absent, {} escalated, {} resolved.",
                outcome.marked_absent, outcome.escalated, outcome.resolved
            );
            if !outcome.failed.is_empty() {
                println!(
                    "{} members could not be re-evaluated; see the log for details.",
                    outcome.failed.len()
                );
            }
        }
        Commands::Status { member, json } => {
            let summary = service
                .get_status(&RequestContext { member_id: member })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Level {} ({}), {} consecutive absences, progress {}%",
                    summary.status_level,
                    summary.attendance_status,
                    summary.absences,
                    summary.progress_percentage
                );
                println!("{}", summary.notification_message);
                if let Some(leader) = summary.caregroup_leader {
                    println!("Caregroup leader: {} ({})", leader.name, leader.caregroup_name);
                }
            }
        }
        Commands::Acknowledge { member } => {
            match service
                .acknowledge(&RequestContext { member_id: member })
                .await?
            {
                Some(record) => println!("Escalation {} acknowledged.", record.id),
                None => println!("No open escalation for {member}."),
            }
        }
        Commands::Redeliver => {
            let delivered = service.notifier().redeliver_pending().await?;
            println!("Redelivered {delivered} notifications.");
        }
        Commands::Report { group, out } => {
            let (stats, standings) = service.group_overview(group).await?;
            let report = report::build_report(&stats, Utc::now().date_naive(), &standings);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::AddGroup { name, leader } => {
            let group = ingest::create_caregroup(&**store, name, leader).await?;
            println!("Caregroup {} created as {}.", group.name, group.id);
        }
        Commands::Enroll { name, email, group } => {
            let member = ingest::enroll(&**store, name, email, group).await?;
            println!("Enrolled {} as {}.", member.full_name, member.id);
        }
        Commands::Assign { member, group } => {
            store.assign_group(member, group).await?;
            println!("Caregroup updated for {member}.");
        }
        Commands::Deactivate { member } => {
            store.deactivate_member(member).await?;
            println!("Member {member} deactivated.");
        }
        Commands::Schedule { title, at } => {
            let gathering = Gathering {
                id: Uuid::new_v4(),
                title,
                starts_at: at,
                finalized: false,
            };
            store.add_gathering(gathering.clone()).await?;
            let stored = store
                .gathering_on(&gathering.title, at)
                .await?
                .context("gathering was not stored")?;
            println!(
                "Gathering {} at {} is {}.",
                stored.title, stored.starts_at, stored.id
            );
        }
        Commands::Demo => run_demo(config).await?,
    }

    Ok(())
}

async fn run_demo(config: &EngineConfig) -> anyhow::Result<()> {
    let service = StatusService::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(LogDispatcher),
        config.settings()?,
    );
    let group_id = ingest::seed(&service).await?;
    let (stats, standings) = service.group_overview(group_id).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for standing in standings {
        println!("{}:", standing.member.full_name);
        println!("{}", serde_json::to_string_pretty(&standing.summary)?);
    }
    Ok(())
}
