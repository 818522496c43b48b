//! Genie - course authoring pipeline CLI
//!
//! Drives a project through ingest, analyze, design, develop, implement and
//! evaluate using offline generation. Projects live as JSON snapshots under
//! `$GENIE_HOME/projects/`.
//!
//! Usage:
//!   genie --org acme init --name "Onboarding" --org-data org.json
//!   genie --org acme sources s1 s2
//!   genie --org acme approve ingest
//!   genie --org acme run
//!   genie --org acme launch
//!   genie --org acme status
//!   genie --org acme exceptions --status open

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use genie_ids::{ExceptionId, RunId};
use genie_logging::{genie_home, init_logging, LogConfig};
use genie_pipeline::{ExceptionResolution, ExceptionStatus, StageId};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

mod commands;
mod offline;
mod output;
mod workspace;

use workspace::Workspace;

#[derive(Parser, Debug)]
#[command(name = "genie", about = "Stage-gated course authoring pipeline", version)]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Organization whose project to work on
    #[arg(long, global = true, env = "GENIE_ORG")]
    org: Option<String>,

    /// Project store directory (overrides [pipeline].store_dir)
    #[arg(long, global = true, env = "GENIE_STORE")]
    store: Option<PathBuf>,

    /// Start with the autopilot armed (overrides [pipeline].autopilot)
    #[arg(long, global = true)]
    autopilot: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a project for the organization
    Init {
        /// Project name
        #[arg(long)]
        name: String,

        /// What the course is about
        #[arg(long, default_value = "")]
        description: String,

        /// JSON file with members, departments, teams and sources
        #[arg(long)]
        org_data: Option<PathBuf>,

        /// Replace an existing project
        #[arg(long)]
        force: bool,
    },

    /// Show stages, approvals and open suggestions
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Select the source documents the course is built from
    Sources {
        /// Source ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Add an enrollment rule (everyone, department:<id>, team:<id>, member:<id>)
    Enroll {
        target: String,

        /// Enroll as optional instead of required
        #[arg(long)]
        optional: bool,
    },

    /// Move to a stage
    Select { stage: StageId },

    /// Approve a stage so the autopilot may run it
    Approve {
        stage: StageId,

        /// Who approved
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Withdraw a stage approval
    Revoke { stage: StageId },

    /// Invoke a named stage action
    Invoke {
        stage: StageId,

        action: String,

        /// JSON payload handed to the action
        #[arg(long)]
        payload: Option<String>,
    },

    /// Run a stage's primary action again after a failure
    Retry { stage: StageId },

    /// Arm the autopilot and run approved stages until it stops
    Run,

    /// Build and launch the course end to end
    Launch {
        /// Do not ask for confirmation between steps
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Ask the copilot about the project
    Chat {
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// List the exception queue, newest first
    Exceptions {
        /// Only entries with this status (open, resolved, rejected, overridden)
        #[arg(long)]
        status: Option<ExceptionStatus>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Close an open exception
    Resolve {
        id: ExceptionId,

        /// resolve, reject or override
        #[arg(long, default_value = "resolve")]
        action: ExceptionResolution,

        /// Who decided
        #[arg(long, default_value = "cli")]
        by: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Show per-phase run metrics, newest first
    Metrics {
        /// Only metrics of this launch run
        #[arg(long)]
        run: Option<RunId>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "genie",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let home = genie_home();
    let mut ws = Workspace::load(&home, cli.store)?;
    if cli.autopilot {
        ws.config_mut().autopilot = true;
    }
    debug!("Using {} with config {:?}", home.display(), ws.config());

    let org = cli
        .org
        .ok_or_else(|| anyhow!("no organization given. TRY: genie --org <ID> ... or set GENIE_ORG"))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match cli.command {
            Commands::Init {
                name,
                description,
                org_data,
                force,
            } => commands::init(&ws, &org, &name, &description, org_data.as_deref(), force).await,
            Commands::Status { json } => commands::status(&ws, &org, json).await,
            Commands::Sources { ids } => commands::select_sources(&ws, &org, ids).await,
            Commands::Enroll { target, optional } => {
                commands::add_enrollment(&ws, &org, &target, optional).await
            }
            Commands::Select { stage } => commands::select(&ws, &org, stage).await,
            Commands::Approve { stage, by } => commands::approve(&ws, &org, stage, &by).await,
            Commands::Revoke { stage } => commands::revoke(&ws, &org, stage).await,
            Commands::Invoke {
                stage,
                action,
                payload,
            } => commands::invoke(&ws, &org, stage, &action, payload.as_deref()).await,
            Commands::Retry { stage } => commands::retry(&ws, &org, stage).await,
            Commands::Run => commands::autopilot(&ws, &org).await,
            Commands::Launch { yes } => commands::launch(&ws, &org, yes).await,
            Commands::Chat { message } => commands::chat(&ws, &org, &message.join(" ")).await,
            Commands::Exceptions { status, json } => commands::exceptions(&ws, &org, status, json).await,
            Commands::Resolve {
                id,
                action,
                by,
                notes,
            } => commands::resolve(&ws, &org, &id, action, &by, notes.as_deref()).await,
            Commands::Metrics { run, json } => commands::metrics(&ws, &org, run.as_ref(), json).await,
        }
    })
}
