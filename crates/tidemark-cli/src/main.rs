mod commands;
mod logging;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tidemark",
    version,
    about = "Declarative incremental ingestion orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to the SQLite state database
    #[arg(
        long,
        env = "TIDEMARK_STATE_DB",
        default_value = "tidemark.db",
        global = true
    )]
    state_db: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every job spec under a directory
    Validate {
        /// Directory holding job YAML documents
        dir: PathBuf,
    },
    /// Show the persisted watermark for a job
    Watermark {
        /// Job name
        job: String,
    },
    /// Show recent runs of a job, newest first
    History {
        /// Job name
        job: String,
        /// Maximum runs to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Print the compute-job manifest a delegated run would submit
    RenderManifest {
        /// Job name
        job: String,
        /// Directory holding job YAML documents
        #[arg(long, default_value = "jobs")]
        spec_dir: PathBuf,
        /// Logical trigger time (RFC 3339); defaults to now
        #[arg(long)]
        logical_time: Option<DateTime<Utc>>,
        /// Attempt number to render for
        #[arg(long, default_value_t = 1)]
        attempt: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Validate { dir } => commands::validate::execute(&dir),
        Commands::Watermark { job } => commands::watermark::execute(&cli.state_db, &job),
        Commands::History { job, limit } => commands::history::execute(&cli.state_db, &job, limit),
        Commands::RenderManifest {
            job,
            spec_dir,
            logical_time,
            attempt,
        } => commands::render_manifest::execute(
            &cli.state_db,
            &spec_dir,
            &job,
            logical_time.unwrap_or_else(Utc::now),
            attempt,
        ),
    }
}
