use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodelink_core::*;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Pause between handshake attempts when `--retries` is given.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "nodelink")]
#[command(about = "Gateway node client and presence monitor")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the default configuration, or print the effective one
    Config {
        #[arg(long)]
        show: bool,
    },

    /// Show (and create if needed) this device's identity
    Identity,

    /// Authenticate against the gateway as a node
    Handshake {
        /// Extra attempts after a transport failure or timeout
        #[arg(short, long, default_value = "0")]
        retries: u32,

        /// Keep the session open and print pushed messages
        #[arg(short, long)]
        listen: bool,
    },

    /// Run the presence monitor
    Monitor {
        #[arg(short, long)]
        background: bool,
    },

    /// Show monitor and connection status
    Status,

    /// Stop the running monitor
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Handle config generation first, before trying to load config
    if let Some(Commands::Config { show: false }) = args.command {
        let config_path = NodeLinkConfig::config_path()?;
        NodeLinkConfig::default().save().await?;
        println!("Generated default config at: {}", config_path.display());
        return Ok(());
    }

    let mut config = match args.config {
        Some(ref path) => NodeLinkConfig::load_from(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => NodeLinkConfig::load().await.context("Failed to load config")?,
    };
    config.apply_env_overrides();

    match args.command {
        Some(Commands::Config { .. }) => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }

        Some(Commands::Identity) => {
            let identity = load_identity(&config).await?;
            println!("Device ID:  {}", identity.device_id());
            println!("Public key: {}", identity.public_key_base64url());
            match config.identity.key_path {
                Some(ref path) => println!("Key file:   {}", path.display()),
                None => println!("Key file:   (ephemeral)"),
            }
        }

        Some(Commands::Handshake { retries, listen }) => {
            let identity = load_identity(&config).await?;
            let session = handshake_with_retries(&identity, &config.gateway, retries).await?;
            println!("Connected to {} as {}", config.gateway.url, identity.device_id());
            println!("{}", serde_json::to_string_pretty(session.hello())?);

            if listen {
                listen_for_pushes(session).await?;
            } else {
                session.close().await?;
            }
        }

        Some(Commands::Monitor { background }) => {
            if let Some(pid) = nodelink_daemon::running_pid()? {
                println!("Monitor is already running (PID: {})", pid);
                return Ok(());
            }

            if background {
                spawn_background_monitor(args.config.as_ref(), args.verbose)?;
            } else {
                nodelink_daemon::write_pid_file()?;
                info!("Running monitor in foreground");
                let result = nodelink_daemon::run_until_shutdown(config).await;
                if let Err(e) = nodelink_daemon::remove_pid_file() {
                    warn!("Failed to remove PID file: {}", e);
                }
                result?;
            }
        }

        Some(Commands::Status) => {
            match nodelink_daemon::running_pid()? {
                Some(pid) => println!("Monitor: running (PID: {})", pid),
                None => println!("Monitor: stopped"),
            }

            let state_path = config.monitor.state_path();
            let state = ConnectionStateStore::load_from_disk(&state_path).await;
            println!("State file: {}", state_path.display());
            println!("Status: {}", state.status);
            if let Some(ref device_id) = state.device_id {
                println!("Device: {}", device_id);
            }
            if let Some(ref host) = state.host {
                println!("Host: {}", host);
            }
            if let Some(ref last_change) = state.last_change {
                println!("Last change: {}", last_change);
            }
            println!("Known devices: {}", state.known_device_ids.len());
        }

        Some(Commands::Stop) => match nodelink_daemon::running_pid()? {
            Some(pid) => {
                nodelink_daemon::request_stop(pid)?;

                tokio::time::sleep(Duration::from_millis(500)).await;
                match nodelink_daemon::running_pid()? {
                    Some(_) => println!("Monitor stop initiated (PID: {})", pid),
                    None => println!("Monitor stopped"),
                }
            }
            None => println!("Monitor is not running"),
        },

        None => {
            use clap::CommandFactory;
            Args::command().print_help()?;
            println!();
        }
    }

    Ok(())
}

async fn load_identity(config: &NodeLinkConfig) -> Result<DeviceIdentity> {
    let identity = match config.identity.key_path {
        Some(ref path) => DeviceIdentity::load_or_generate(path)
            .await
            .with_context(|| format!("Failed to load device key from {}", path.display()))?,
        None => DeviceIdentity::generate().context("Failed to generate device key")?,
    };
    Ok(identity)
}

async fn handshake_with_retries(
    identity: &DeviceIdentity,
    gateway: &GatewayConfig,
    retries: u32,
) -> Result<GatewaySession<GatewayStream>> {
    let mut attempt = 0;
    loop {
        match HandshakeClient::new(identity, gateway).connect().await {
            Ok(session) => return Ok(session),
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!(
                    "Handshake attempt {} failed: {}; retrying in {:?}",
                    attempt, e, RETRY_BACKOFF
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Handshake failed")),
        }
    }
}

async fn listen_for_pushes<S>(session: GatewaySession<S>) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let forward = tokio::spawn(session.forward(tx));

    println!("Listening for gateway messages (Press Ctrl+C to stop)");
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => println!("{}", message),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopped listening");
                forward.abort();
                return Ok(());
            }
        }
    }

    forward.await.context("Gateway listener task failed")??;
    println!("Gateway closed the connection");
    Ok(())
}

/// Relaunch this binary as a detached foreground monitor writing to the log
/// file.
fn spawn_background_monitor(config: Option<&PathBuf>, verbose: bool) -> Result<()> {
    use std::process::{Command, Stdio};

    let current_exe = std::env::current_exe().context("Failed to get current executable")?;
    let mut cmd = Command::new(&current_exe);
    if let Some(path) = config {
        cmd.arg("--config").arg(path);
    }
    if verbose {
        cmd.arg("--verbose");
    }
    cmd.arg("monitor");

    let log_path = nodelink_daemon::log_file_path()?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&log_path, std::fs::Permissions::from_mode(0o600))?;
    }

    cmd.stdout(log_file.try_clone()?)
        .stderr(log_file)
        .stdin(Stdio::null());

    let child = cmd.spawn().context("Failed to spawn monitor process")?;
    println!("Monitor started with PID: {}", child.id());
    println!("Log file: {}", log_path.display());
    Ok(())
}
