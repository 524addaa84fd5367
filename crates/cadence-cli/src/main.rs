//! Cadence CLI: run YAML-defined agent workflows from the terminal.
//!
//! Usage:
//!   cadence run <workflow> [--var KEY=VALUE]...   Execute a workflow
//!   cadence validate <workflow>                   Compile without running
//!   cadence list                                  List project workflows

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};

use cadence_cli::commands;
use cadence_cli::commands::workflow::RunOptions;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Cadence: declarative workflow orchestration for coding agents"
)]
struct Cli {
    /// Project directory containing `.cadence/`
    #[arg(long, global = true, env = "CADENCE_PROJECT", default_value = ".")]
    project: PathBuf,

    /// Port for the completion callback listener
    #[arg(long, global = true, env = "CADENCE_CALLBACK_PORT")]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow by name, file stem or path
    Run {
        workflow: String,

        /// Variable override, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a workflow without executing it
    Validate { workflow: String },

    /// List discovered workflows
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "cadence_core=debug,cadence_cli=debug"
    } else {
        "cadence_core=info,cadence_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    commands::load_dotenv(&cli.project);

    let result = match cli.command {
        Some(Commands::Run {
            workflow,
            vars,
            json,
        }) => {
            let opts = RunOptions {
                vars,
                callback_port: cli.port,
                json,
            };
            commands::workflow::run(&cli.project, &workflow, &opts).await
        }
        Some(Commands::Validate { workflow }) => commands::workflow::validate(&cli.project, &workflow),
        Some(Commands::List) => commands::workflow::list(&cli.project),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
