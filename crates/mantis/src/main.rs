// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mantis, a multi-channel AI assistant for remote systems.
//!
//! Binary entry point.

use clap::{Parser, Subcommand};

mod serve;

/// Mantis, a multi-channel AI assistant for remote systems.
#[derive(Parser, Debug)]
#[command(name = "mantis", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the Mantis agent server.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if let Err(err) = serve::run_serve().await {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
    }
}
