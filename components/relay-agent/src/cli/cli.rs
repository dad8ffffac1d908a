// Local crates
use crate::helpers::load_config::Config;
use crate::runtime;

// External crates
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit codes: 0 clean shutdown, 1 fatal startup/runtime error, 2 invalid
/// configuration.
const EXIT_FATAL: u8 = 1;
const EXIT_BAD_CONFIG: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "relay_agent",
    version,
    about = "High-throughput log collection and aggregation agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent as a daemon
    Run {
        #[arg(short, long, default_value = "/etc/relay/agent.toml")]
        config: PathBuf,
    },

    /// Validate the configuration file without starting anything
    Validate {
        #[arg(short, long, default_value = "/etc/relay/agent.toml")]
        config: PathBuf,
    },

    /// Display version information
    Version,
}

/// Entry function for the CLI.
pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = match Config::load(&config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {e}");
                    return ExitCode::from(EXIT_BAD_CONFIG);
                }
            };
            match runtime::runtime::run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "Agent exited with a fatal error");
                    eprintln!("fatal: {e:#}");
                    ExitCode::from(EXIT_FATAL)
                }
            }
        }
        Commands::Validate { config } => match Config::load(&config) {
            Ok(parsed) => {
                println!("configuration valid:\n{parsed:#?}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("configuration error: {e}");
                ExitCode::from(EXIT_BAD_CONFIG)
            }
        },
        Commands::Version => {
            println!("Relay Agent {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}
