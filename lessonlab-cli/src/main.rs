use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "lessonlab", about = "Run and inspect lessonlab experiment sessions")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the condition and items a participant id is assigned
    Assign(commands::assign::AssignArgs),
    /// Manage configuration
    Config(commands::config::ConfigArgs),
    /// List stored records for a participant
    Records(commands::records::RecordsArgs),
    /// Walk a simulated participant through every stage
    Simulate(commands::simulate::SimulateArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Assign(args) => commands::assign::run(args),
        Commands::Config(args) => commands::config::run(args),
        Commands::Records(args) => commands::records::run(args).await,
        Commands::Simulate(args) => commands::simulate::run(args).await,
    }
}
