// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Receiptlink: command-line front end for wireless thermal receipt printers.
//
// Entry point. Initialises logging, parses the command line and hands over to
// `commands`.

mod commands;
mod services;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use receiptlink_core::human_errors::humanize_error;

/// Receiptlink - talk to a thermal receipt printer
#[derive(Parser, Debug)]
#[command(name = "receiptlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (defaults to the data directory's config.json)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Treat the printer as 80 mm paper
    #[arg(long, global = true)]
    pub wide: bool,

    /// Force the command-set family instead of guessing from the name
    #[arg(long, global = true, value_enum)]
    pub vendor: Option<VendorArg>,

    /// Print nothing; dump the bytes that would have been sent as hex
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List printers the radio can see
    Scan {
        /// Seconds to wait for the radio
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Print the built-in test page
    Test { address: String },
    /// Print a marked-up text file
    Print { address: String, file: PathBuf },
    /// Ask the printer for its status
    Health { address: String },
    /// Run the step-by-step printer check
    Diagnose {
        address: String,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep the default printer connected and auto-print new orders
    Watch {
        /// Make this address the default printer and turn auto-print on
        #[arg(long)]
        printer: Option<String>,
        /// Order database (defaults to the data directory's orders.db)
        #[arg(long, value_name = "FILE")]
        orders: Option<PathBuf>,
        /// Shop name printed at the top of customer copies
        #[arg(long, default_value = "Receiptlink")]
        shop: String,
        /// Milliseconds between order store polls
        #[arg(long, default_value = "2000")]
        poll_ms: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VendorArg {
    Generic,
    Raster,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let human = humanize_error(&e);
            eprintln!("Error: {}", human.message);
            eprintln!("{}", human.suggestion);
            tracing::debug!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
