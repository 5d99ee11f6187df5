//! CLI for coordinator administration

use anyhow::Context;
use clap::{Parser, Subcommand};
use spacecoord::coordinator::control::SUCCESS;
use spacecoord::coordinator::space_desc::parse_space;
use spacecoord::coordinator::{ControlClient, ControlRequest, ControlResponse};
use std::io::Read;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "spacecoord-ctl")]
#[command(about = "spacecoord coordinator control CLI")]
#[command(version)]
struct Cli {
    /// Coordinator host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Coordinator control port
    #[arg(long, default_value = "6970")]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a space from a description read on stdin
    AddSpace,

    /// Delete a space
    DelSpace {
        /// Space name
        name: String,
    },

    /// Check a description read on stdin without contacting the coordinator
    ValidateSpace,

    /// List space names
    LstSpaces,

    /// Show one space as JSON
    GetSpace {
        /// Space name
        name: String,
    },

    /// Stop accepting changes and announce a state id
    Quiesce,

    /// Shut the cluster down and print the snapshot
    Shutdown,

    /// Show coordinator status
    GetStatus,

    /// Leave STARTUP after a restore
    GoLive,

    /// Print a snapshot of the coordinator state
    BackupState,
}

fn read_description() -> anyhow::Result<String> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("reading space description from stdin")?;
    Ok(text)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let request = match cli.command {
        Commands::ValidateSpace => {
            let text = read_description()?;
            return Ok(match parse_space(&text) {
                Ok(space) => {
                    println!("{}", serde_json::to_string_pretty(&space)?);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            });
        }
        Commands::AddSpace => {
            let text = read_description()?;
            if let Err(e) = parse_space(&text) {
                eprintln!("{}", e);
                return Ok(ExitCode::FAILURE);
            }
            ControlRequest::AddSpace(text)
        }
        Commands::DelSpace { name } => ControlRequest::DelSpace(name),
        Commands::LstSpaces => ControlRequest::LstSpaces,
        Commands::GetSpace { name } => ControlRequest::GetSpace(name),
        Commands::Quiesce => ControlRequest::Quiesce,
        Commands::Shutdown => ControlRequest::Shutdown,
        Commands::GetStatus => ControlRequest::GetStatus,
        Commands::GoLive => ControlRequest::GoLive,
        Commands::BackupState => ControlRequest::BackupState,
    };

    let mut client = ControlClient::connect((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("connecting to {}:{}", cli.host, cli.port))?;

    match client.request(&request).await {
        Ok(ControlResponse::Done(result)) => {
            if result != SUCCESS && !result.is_empty() {
                println!("{}", result);
            }
            Ok(ExitCode::SUCCESS)
        }
        Ok(ControlResponse::Refused(msg)) => {
            eprintln!("{} failed: {}", request.verb(), msg);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
