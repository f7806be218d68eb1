//! resumer - resumable response recording for AI agent conversations
//!
//! `resumer serve` runs a node; the other subcommands are thin clients over
//! the wire protocol.

use clap::Parser;
use resumer::client::{self, RemoteRecorder};
use resumer::config::{self, Config, DEFAULT_LISTEN};
use resumer::locator::{self, DirectoryKind};
use resumer::node::Node;
use resumer::session::RecordingState;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "resumer", about = "Resumable response recording and replay")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run a resumer node
    Serve {
        /// Config file (defaults to the platform config directory)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Socket address to bind
        #[arg(long)]
        listen: Option<String>,
        /// `host:port` advertised to other nodes
        #[arg(long)]
        advertise: Option<String>,
        /// Spool directory
        #[arg(long)]
        spool_dir: Option<PathBuf>,
        /// Locator directory backend
        #[arg(long, value_enum)]
        directory: Option<DirectoryKind>,
        /// Shared path for the `file` locator backend
        #[arg(long)]
        directory_path: Option<PathBuf>,
    },
    /// Record stdin, one chunk per line
    Record {
        conversation_id: String,
        /// Node to contact
        #[arg(short, long, default_value = DEFAULT_LISTEN)]
        address: String,
    },
    /// Replay a recording to stdout
    Replay {
        conversation_id: String,
        #[arg(short, long, default_value = DEFAULT_LISTEN)]
        address: String,
    },
    /// Cancel an active recording
    Cancel {
        conversation_id: String,
        #[arg(short, long, default_value = DEFAULT_LISTEN)]
        address: String,
    },
    /// Print which conversations are being recorded
    Check {
        #[arg(required = true)]
        conversation_ids: Vec<String>,
        #[arg(short, long, default_value = DEFAULT_LISTEN)]
        address: String,
    },
    /// Write a config file with every setting at its default
    InitConfig {
        /// Target file (defaults to the platform config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("RESUMER_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Merge CLI overrides into the loaded config.
fn serve_config(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    advertise: Option<String>,
    spool_dir: Option<PathBuf>,
    directory: Option<DirectoryKind>,
    directory_path: Option<PathBuf>,
) -> Config {
    let mut config = match config_path {
        Some(path) => config::load_config_from(&path),
        None => config::load_config(),
    };
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if advertise.is_some() {
        config.advertised_address = advertise;
    }
    if spool_dir.is_some() {
        config.spool_dir = spool_dir;
    }
    if let Some(kind) = directory {
        config.directory.kind = kind;
    }
    if directory_path.is_some() {
        config.directory.path = directory_path;
    }
    config
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let directory = locator::open_directory(config.directory.kind, config.directory.path.as_deref())?;
    let node = Node::bind(&config, directory).await?;
    info!(node = %node.address(), "serving");
    tokio::select! {
        _ = node.run() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

async fn record(address: &str, conversation_id: &str) -> Result<RecordingState, Box<dyn std::error::Error>> {
    let mut recorder = RemoteRecorder::begin(address, conversation_id).await?;
    info!(node = recorder.node(), "recording");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match recorder.append(&format!("{line}\n")).await {
            Ok(()) => {}
            Err(client::ClientError::Cancelled) => return Ok(RecordingState::Cancelled),
            Err(e) => return Err(e.into()),
        }
    }
    let status = recorder.complete().await?;
    if let Some(message) = &status.error_message {
        error!(%message, "recording failed");
    }
    Ok(status.state)
}

async fn replay(address: &str, conversation_id: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let Some(mut stream) = client::replay(address, conversation_id).await? else {
        return Ok(false);
    };
    info!(node = stream.served_by(), "replaying");
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.next().await? {
        stdout.write_all(chunk.as_bytes()).await?;
        stdout.flush().await?;
    }
    if let Some(status) = stream.status() {
        match &status.error_message {
            Some(message) => eprintln!("[{}: {}]", status.state, message),
            None => eprintln!("[{}]", status.state),
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Serve {
            config,
            listen,
            advertise,
            spool_dir,
            directory,
            directory_path,
        } => {
            let config = serve_config(config, listen, advertise, spool_dir, directory, directory_path);
            serve(config).await.map(|()| true)
        }
        Command::Record {
            conversation_id,
            address,
        } => record(&address, &conversation_id).await.map(|state| {
            println!("{state}");
            state == RecordingState::Completed
        }),
        Command::Replay {
            conversation_id,
            address,
        } => replay(&address, &conversation_id).await.map(|found| {
            if !found {
                eprintln!("no recording for {conversation_id}");
            }
            found
        }),
        Command::Cancel {
            conversation_id,
            address,
        } => client::cancel(&address, &conversation_id)
            .await
            .map(|accepted| {
                println!("{}", if accepted { "accepted" } else { "not accepted" });
                accepted
            })
            .map_err(Into::into),
        Command::Check {
            conversation_ids,
            address,
        } => client::check_recordings(&address, &conversation_ids)
            .await
            .map(|active| {
                for id in &active {
                    println!("{id}");
                }
                true
            })
            .map_err(Into::into),
        Command::InitConfig { config } => {
            let defaults = Config::default();
            match config {
                Some(path) => config::save_config_to(&defaults, &path),
                None => config::save_config(&defaults),
            }
            .map(|()| true)
            .map_err(Into::into)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
