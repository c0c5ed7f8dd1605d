pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "tollgate",
    about = "Tollgate approval engine operator CLI",
    long_about = "Operate the Tollgate approval engine: migrations, readiness checks, config inspection, escalation sweeps, and cart status lookups.",
    after_help = "Examples:\n  tollgate doctor --json\n  tollgate escalate --limit 50\n  tollgate status --cart cart_01HX"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity, and schema migration state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Flag pending approvals that outlived their company's escalation timeout")]
    Escalate {
        #[arg(long, help = "Maximum approvals to examine (default: approvals.escalation_sweep_batch_size)")]
        limit: Option<u32>,
    },
    #[command(about = "Show the aggregate approval status and live approvals of a cart")]
    Status {
        #[arg(long, help = "Cart or order identifier")]
        cart: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Escalate { limit } => commands::escalate::run(limit),
        Command::Status { cart } => commands::status::run(&cart),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
