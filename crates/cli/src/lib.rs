pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clerk_core::config::LoadOptions;

#[derive(Debug, Parser)]
#[command(
    name = "clerk",
    about = "Clerk shop assistant CLI",
    long_about = "Chat with the shop assistant, inspect stored conversations, and operate schema and config readiness.",
    after_help = "Examples:\n  clerk migrate\n  clerk chat --message \"Sony headphones under $100\"\n  clerk state <conversation-id> --history\n  clerk doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Read configuration from this file")]
    config: Option<PathBuf>,
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
    #[command(about = "Validate config, database schema, and model client readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run conversation turns against the demo shop")]
    Chat {
        #[arg(long, value_name = "ID", help = "Continue this conversation instead of a new one")]
        conversation: Option<String>,
        #[arg(
            long = "message",
            short = 'm',
            value_name = "TEXT",
            help = "Send this message as a turn; repeat for several turns. Reads stdin when absent"
        )]
        messages: Vec<String>,
    },
    #[command(about = "Show the stored state of a conversation")]
    State {
        conversation_id: String,
        #[arg(long, help = "List every checkpoint instead of the latest state")]
        history: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config, ..LoadOptions::default() };

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(&options) }
        }
        Command::Doctor { json } => {
            let (output, passed) = commands::doctor::run(&options, json);
            commands::CommandResult { exit_code: if passed { 0 } else { 1 }, output }
        }
        Command::Chat { conversation, messages } => {
            commands::chat::run(&options, conversation, messages)
        }
        Command::State { conversation_id, history } => {
            commands::state::run(&options, &conversation_id, history)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
