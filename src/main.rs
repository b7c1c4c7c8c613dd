//! admin-notify - admin panel push notification client
//!
//! Holds one authenticated WebSocket to the backend's push endpoint and
//! prints every notification it receives. The connection is retried a
//! bounded number of times after unexpected drops and closed with
//! "User logout" on Ctrl+C.
//!
//! Usage:
//!   admin-notify listen --token <token>              # ws://127.0.0.1:9000/ws
//!   admin-notify listen --endpoint wss://host/ws     # token from ~/.admin-notify/token
//!   admin-notify serve --port 9000                   # loopback push server, JSON lines from stdin

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use notify_protocol::{CloseCodes, PushMessage};
use notify_transport::{
    ChannelConfig, NotificationChannel, NotificationSink, PushServer, PushServerConfig,
    StaticToken, TokenFile, TokenProvider,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "admin-notify", about = "Admin panel push notification client")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the push endpoint and print notifications
    Listen {
        /// WebSocket base endpoint (the token is appended as a query parameter)
        #[arg(long, env = "ADMIN_NOTIFY_ENDPOINT", default_value = notify_transport::config::DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Bearer token, with or without the "Bearer " prefix
        #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// File holding the token (defaults to ~/.admin-notify/token)
        #[arg(long, conflicts_with = "token")]
        token_file: Option<PathBuf>,

        /// Automatic reconnect attempts after an unexpected drop
        #[arg(long, default_value = "5")]
        max_retries: u32,

        /// Delay before each reconnect attempt
        #[arg(long, default_value = "3000")]
        retry_delay_ms: u64,

        /// Give up on an open that takes longer than this
        #[arg(long, default_value = "10000")]
        connect_timeout_ms: u64,
    },

    /// Run a loopback push server; each JSON line on stdin is pushed to all clients
    Serve {
        /// Port to listen on (0 for OS-assigned)
        #[arg(long, default_value = "9000")]
        port: u16,

        /// Hostname to bind to
        #[arg(long, default_value = "127.0.0.1")]
        hostname: String,

        /// Only accept clients presenting this token
        #[arg(long)]
        token: Option<String>,
    },
}

/// Prints each push on stdout.
struct StdoutSink;

impl NotificationSink for StdoutSink {
    fn show_notification(&self, message: &PushMessage) {
        match message.notification() {
            Some(n) => match n.target() {
                Some((target, id)) => {
                    println!("[{}] {}: {} ({target} #{id})", n.kind, n.title, n.content)
                }
                None => println!("[{}] {}: {}", n.kind, n.title, n.content),
            },
            None => println!("{}", message.value()),
        }
    }
}

fn init_tracing(verbose: bool, log_file: Option<&PathBuf>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match std::fs::OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .init();
                eprintln!("Logging to {}", log_path.display());
                return;
            }
            Err(e) => eprintln!("Failed to open log file {}: {e}", log_path.display()),
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_ref());

    match cli.command {
        Command::Listen {
            endpoint,
            token,
            token_file,
            max_retries,
            retry_delay_ms,
            connect_timeout_ms,
        } => {
            let config = ChannelConfig {
                endpoint,
                max_reconnect_attempts: max_retries,
                reconnect_delay: Duration::from_millis(retry_delay_ms),
                connect_timeout: Duration::from_millis(connect_timeout_ms),
            };
            let provider = match resolve_token_provider(token, token_file) {
                Ok(provider) => provider,
                Err(e) => {
                    error!("{e}");
                    std::process::exit(1);
                }
            };
            listen(config, provider.as_ref()).await;
        }
        Command::Serve { port, hostname, token } => {
            let config = PushServerConfig { port, hostname, token };
            if let Err(e) = serve(config).await {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }
}

/// `--token`/`ADMIN_TOKEN` wins; otherwise the token file.
fn resolve_token_provider(
    token: Option<String>,
    token_file: Option<PathBuf>,
) -> Result<Box<dyn TokenProvider>, String> {
    if let Some(raw) = token {
        let provider = StaticToken::new(&raw).map_err(|e| format!("invalid --token: {e}"))?;
        return Ok(Box::new(provider));
    }
    let path = token_file
        .or_else(TokenFile::default_path)
        .ok_or_else(|| "no --token given and no home directory for the token file".to_string())?;
    Ok(Box::new(TokenFile::new(path)))
}

async fn listen(config: ChannelConfig, provider: &dyn TokenProvider) {
    println!();
    println!("  Endpoint:   {}", config.endpoint);
    println!(
        "  Retries:    {} every {} ms",
        config.max_reconnect_attempts,
        config.reconnect_delay.as_millis()
    );
    println!("  Press Ctrl+C to log out.");
    println!();

    // Composition root: the one channel for this session.
    let channel = NotificationChannel::new(config);
    let banner = Arc::new(StdoutSink);
    channel.set_notification_banner(&banner);

    let mut status = channel.subscribe();
    channel.connect_with(provider);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *status.borrow_and_update();
                info!(
                    state = ?snapshot.state,
                    attempts = snapshot.reconnect_attempts,
                    "channel state changed"
                );
            }
        }
    }

    channel.disconnect();
    channel.shutdown().await;
    println!("  Logged out.");
}

async fn serve(config: PushServerConfig) -> Result<(), notify_transport::ServerError> {
    let mut server = PushServer::start(config).await?;

    println!();
    println!("  Push endpoint:  {}", server.endpoint());
    println!("  Each stdin line is pushed to every client:");
    println!("    <json>        push a notification");
    println!("    :raw <text>   push a raw text frame");
    println!("    :drop         drop all clients without a close handshake");
    println!("    :close        close all clients cleanly");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                };
                handle_serve_line(&server, line.trim());
            }
        }
    }

    server.stop().await;
    Ok(())
}

fn handle_serve_line(server: &PushServer, line: &str) {
    if line.is_empty() {
        return;
    }
    let delivered = if let Some(raw) = line.strip_prefix(":raw ") {
        server.push_text(raw)
    } else if line == ":drop" {
        server.drop_connections()
    } else if line == ":close" {
        server.close_connections(CloseCodes::NORMAL, "Server closed")
    } else {
        match PushMessage::parse(line) {
            Ok(message) => server.push(&message),
            Err(e) => {
                warn!("not pushed: {e}");
                return;
            }
        }
    };
    info!(clients = delivered, "sent");
}
