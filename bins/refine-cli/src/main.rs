mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "refine-cli")]
#[command(about = "Refine CLI - Solve problems with the refinement pipeline, locally or through the worker queue", long_about = None)]
struct Cli {
    /// Emit logs and results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve one or more problem files in this process
    Solve {
        /// Problem files (.json, .yaml or .yml)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Solver config (defaults to $REFINE_CONFIG or config/solver.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write each final program into this directory
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },

    /// Queue a problem for a worker
    Submit {
        /// Problem file (.json, .yaml or .yml)
        file: PathBuf,
    },

    /// Fetch a stored result by job id
    Result {
        /// Job id printed by `submit`
        id: String,
    },

    /// Load the config and run every startup check
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    commands::init_logging(cli.json);

    match cli.command {
        Commands::Solve {
            files,
            config,
            out_dir,
        } => {
            commands::solve(&files, config.as_deref(), out_dir.as_deref(), cli.json).await?;
        }
        Commands::Submit { file } => {
            commands::submit(&file).await?;
        }
        Commands::Result { id } => {
            commands::fetch_result(&id, cli.json).await?;
        }
        Commands::CheckConfig { config } => {
            commands::check_config(config.as_deref()).await?;
        }
    }

    Ok(())
}
