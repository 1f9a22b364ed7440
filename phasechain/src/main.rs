//! Command-line entry point for phase chain configs and memory stores.
//!
//! Chains themselves run inside a host application that registers phase
//! executors; the CLI validates their configs and inspects persisted memory.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use phasechain::commands::{QueryOutcome, prune_memory, query_memory, validate_config};
use phasechain::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "phasechain",
    version,
    about = "Reliability layer for multi-agent phase chains"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a chain config.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Inspect or maintain a persisted long-term memory log.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Print the entries most relevant to a query.
    Query {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        query: String,
        #[arg(short, long, default_value_t = 5)]
        k: usize,
    },
    /// Keep only the newest entries.
    Prune {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        keep: usize,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => {
            let summary = validate_config(&config)?;
            println!(
                "ok: {} step(s), {} constrained role(s)",
                summary.steps, summary.roles
            );
            for phase in &summary.phases {
                println!("  {phase}");
            }
            Ok(exit_codes::OK)
        }
        Command::Memory { command } => match command {
            MemoryCommand::Query { store, query, k } => match query_memory(&store, &query, k)? {
                QueryOutcome::Empty => {
                    println!("no matches");
                    Ok(exit_codes::EMPTY)
                }
                QueryOutcome::Matches(matches) => {
                    for hit in matches {
                        let role = hit.role.as_deref().unwrap_or("-");
                        println!("{}\t{:.3}\t{}\t{}", hit.seq, hit.score, role, hit.text);
                    }
                    Ok(exit_codes::OK)
                }
            },
            MemoryCommand::Prune { store, keep } => {
                let report = prune_memory(&store, keep)?;
                println!("pruned {} -> {} entries", report.before, report.after);
                Ok(exit_codes::OK)
            }
        },
    }
}
