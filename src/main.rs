//! kvmgr CLI entry point.

use clap::{Parser, Subcommand};

mod cli;

/// kvmgr - KVM virtual machine manager
#[derive(Parser, Debug)]
#[command(name = "kvmgr")]
#[command(about = "KVM virtual machine manager with disk exports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API server.
    Serve(cli::serve::ServeCmd),

    /// Inspect configuration.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(),
        Commands::Config(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
