mod client;
mod config;
mod server;

use clap::{Args, Parser, Subcommand};
use client::HttpEndpoint;
use config::Config;
use depot_core::{ArtifactKind, ArtifactRequest, ArtifactResponse, OpType, TransferClient, Version};
use serde::Serialize;
use server::run_server;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Replicated store for versioned configs, dictionaries and plugins")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Target {
    /// Server address, host:port
    #[arg(long, default_value = "127.0.0.1:7100")]
    server: String,

    /// Artifact kind: config, dict or plugin
    #[arg(long)]
    kind: ArtifactKind,

    /// Artifact name
    #[arg(long)]
    name: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a replica
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,
    },
    /// Upload a file as a new artifact version (resumes an interrupted upload)
    Upload {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        version: Version,
        /// File extension recorded with the artifact
        #[arg(long, default_value = "")]
        ext: String,
        #[arg(long)]
        file: PathBuf,
        /// Upload chunk size in bytes
        #[arg(long, default_value_t = depot_core::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Download an artifact version (latest by default) and verify its md5
    Download {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        version: Option<Version>,
        #[arg(long)]
        output: PathBuf,
    },
    /// Show an artifact record
    Info {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        version: Option<Version>,
        /// Look in the tombstone index
        #[arg(long)]
        tombstone: bool,
    },
    /// List artifacts, or the versions of one name
    List {
        #[arg(long, default_value = "127.0.0.1:7100")]
        server: String,
        #[arg(long)]
        kind: ArtifactKind,
        /// Names to list; all names when empty
        names: Vec<String>,
        #[arg(long)]
        tombstone: bool,
        /// List versions of the single given name
        #[arg(long)]
        versions: bool,
    },
    /// Move an artifact version (all versions by default) to the tombstone
    Remove {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        version: Option<Version>,
    },
    /// Bring a tombstoned version (all by default) back
    Restore {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        version: Option<Version>,
    },
    /// Permanently delete a tombstoned version (all by default)
    Purge {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        version: Option<Version>,
    },
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(error) => {
            tracing::error!("Failed to render output: {}", error);
            std::process::exit(1);
        }
    }
}

fn exit_on_error<T>(result: depot_core::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => {
            tracing::error!("{}", error);
            std::process::exit(1);
        }
    }
}

async fn send(server: String, request: ArtifactRequest) -> ArtifactResponse {
    let client = TransferClient::new(HttpEndpoint::new(server));
    exit_on_error(client.send(request).await)
}

fn request_for(op: OpType, target: &Target, version: Option<Version>) -> ArtifactRequest {
    let mut request = ArtifactRequest::new(op, target.kind, target.name.clone());
    request.version = version;
    request
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { conf } => {
            tracing::info!("Starting Depot with config: {}", conf);

            let cfg = match Config::from_file(&conf) {
                Ok(c) => c,
                Err(error) => {
                    tracing::error!("Failed to load config: {}", error);
                    std::process::exit(1);
                }
            };

            if let Err(error) = run_server(cfg).await {
                tracing::error!("Server error: {}", error);
                std::process::exit(1);
            }
        }
        Commands::Upload {
            target,
            version,
            ext,
            file,
            chunk_size,
        } => {
            let client =
                TransferClient::new(HttpEndpoint::new(target.server.clone())).with_chunk_size(chunk_size);
            let artifact = exit_on_error(
                client
                    .upload_file(target.kind, &target.name, version, &ext, &file)
                    .await,
            );
            print_json(&artifact);
        }
        Commands::Download {
            target,
            version,
            output,
        } => {
            let client = TransferClient::new(HttpEndpoint::new(target.server.clone()));
            let artifact = exit_on_error(
                client
                    .download_to(target.kind, &target.name, version, &output)
                    .await,
            );
            print_json(&artifact);
        }
        Commands::Info {
            target,
            version,
            tombstone,
        } => {
            let op = if tombstone {
                OpType::TombstoneInfo
            } else {
                OpType::Info
            };
            let response = send(target.server.clone(), request_for(op, &target, version)).await;
            print_json(&response.artifact);
        }
        Commands::List {
            server,
            kind,
            names,
            tombstone,
            versions,
        } => {
            if versions {
                let [name] = names.as_slice() else {
                    tracing::error!("--versions needs exactly one name");
                    std::process::exit(2);
                };
                let op = if tombstone {
                    OpType::TombstoneListVersion
                } else {
                    OpType::ListVersion
                };
                let response = send(server, ArtifactRequest::new(op, kind, name.clone())).await;
                print_json(&response.versions);
            } else {
                let op = if tombstone {
                    OpType::TombstoneList
                } else {
                    OpType::List
                };
                let mut request = ArtifactRequest::new(op, kind, "");
                request.names = names;
                let response = send(server, request).await;
                print_json(&response.artifacts);
            }
        }
        Commands::Remove { target, version } => {
            let response =
                send(target.server.clone(), request_for(OpType::Remove, &target, version)).await;
            print_json(&response.artifacts);
        }
        Commands::Restore { target, version } => {
            let response = send(
                target.server.clone(),
                request_for(OpType::RestoreTombstone, &target, version),
            )
            .await;
            print_json(&response.artifacts);
        }
        Commands::Purge { target, version } => {
            let response = send(
                target.server.clone(),
                request_for(OpType::RemoveTombstone, &target, version),
            )
            .await;
            print_json(&response.artifacts);
        }
    }
}
