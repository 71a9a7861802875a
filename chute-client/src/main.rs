// Chute client: register, log in, and upload files to a chute server.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chute_client::{config, login, register, spawn_upload, Link, UploadRequest};
use chute_core::{RetryCause, UploadEvent};

#[derive(Debug, Parser)]
#[command(name = "chute-client", version, about = "Upload files to a chute server over UDP")]
struct Args {
    /// Config file (default: ~/.config/chute/client.toml, then /etc/chute/client.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Server address, e.g. 127.0.0.1:12345.
    #[arg(long, global = true)]
    server: Option<String>,
    /// Per-reply timeout in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Attempts per protocol step.
    #[arg(long, global = true)]
    retry_limit: Option<u32>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an account.
    Register { username: String, password: String },
    /// Check credentials.
    Login { username: String, password: String },
    /// Log in, then upload a file.
    Upload {
        file: PathBuf,
        #[arg(long, short)]
        user: String,
        #[arg(long, short)]
        password: String,
        /// Name announced to the server (default: the file's own name).
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(server) = args.server {
        cfg.server = server;
    }
    if let Some(ms) = args.timeout_ms {
        cfg.timeout_ms = ms.max(1);
    }
    if let Some(n) = args.retry_limit {
        cfg.retry_limit = n.max(1);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let link = Link::connect(&cfg.server, cfg.timeout())
            .await
            .with_context(|| format!("connecting to {}", cfg.server))?;
        match args.command {
            Command::Register { username, password } => {
                if register(&link, &username, &password).await? {
                    println!("Registered {username}");
                } else {
                    bail!("registration refused for {username}");
                }
            }
            Command::Login { username, password } => {
                if login(&link, &username, &password).await? {
                    println!("Login OK");
                } else {
                    bail!("login failed for {username}");
                }
            }
            Command::Upload {
                file,
                user,
                password,
                name,
            } => {
                if !login(&link, &user, &password).await? {
                    bail!("login failed for {user}");
                }
                let mut handle = spawn_upload(
                    link,
                    UploadRequest {
                        path: file,
                        remote_name: name,
                        uploader: user,
                        retry_limit: cfg.retry_limit,
                    },
                );
                loop {
                    tokio::select! {
                        event = handle.next_event() => match event {
                            Some(e) => print_event(&e),
                            None => break,
                        },
                        _ = tokio::signal::ctrl_c() => {
                            println!("Cancelling...");
                            handle.cancel();
                        }
                    }
                }
                let report = handle.wait().await?;
                println!(
                    "Sent {} ({} bytes, {} fragments), sha256 {}",
                    report.filename, report.bytes, report.fragment_count, report.sha256
                );
            }
        }
        anyhow::Ok(())
    })?;
    Ok(())
}

fn print_event(event: &UploadEvent) {
    match event {
        UploadEvent::Started {
            filename,
            fragment_count,
            total_size,
        } => println!("Sending {filename}: {total_size} bytes in {fragment_count} fragments"),
        UploadEvent::FragmentAcked {
            sequence,
            fragment_count,
        } => println!("Fragment {}/{} acknowledged", sequence + 1, fragment_count),
        UploadEvent::Retrying {
            step,
            attempt,
            cause,
        } => match cause {
            RetryCause::Timeout => println!("{step}: no reply, resending (attempt {})", attempt + 1),
            RetryCause::Unexpected(reply) => println!(
                "{step}: server replied `{reply}`, resending (attempt {})",
                attempt + 1
            ),
        },
        UploadEvent::Completed { filename, .. } => println!("Upload of {filename} complete"),
        UploadEvent::Failed { error } => println!("Upload failed: {error}"),
    }
}
