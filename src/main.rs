//! sshtrap - high-interaction SSH man-in-the-middle honeypot
//!
//! Terminates attacker SSH sessions locally, mirrors them onto a real
//! upstream victim with operator credentials, relays all traffic, and
//! records interactive sessions as asciicast v2 files.

use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use sshtrap::config::{ensure_ssh_port, ConfigError, Credentials, ProxyConfig, SilentSet};
use sshtrap::ssh::session::{serve, SessionContext};
use sshtrap::{keys, probe, ssh};

#[derive(Parser)]
#[command(name = "sshtrap", version, about = "High-interaction SSH MitM honeypot")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:2222")]
    listen: String,

    /// Upstream (victim) address; the SSH port is appended when missing
    #[arg(short, long, default_value = "192.168.0.2:22")]
    upstream: String,

    /// Username for the upstream connection
    #[arg(long, default_value = "root")]
    upstream_user: String,

    /// Server host key file, created when missing
    #[arg(long, default_value = "host_key")]
    host_key: PathBuf,

    /// Client key used against the upstream, created when missing
    #[arg(long, default_value = "client_key")]
    client_key: PathBuf,

    /// Pinned upstream host key, fetched on first use
    #[arg(long, default_value = "upstream_host_key")]
    upstream_host_key: PathBuf,

    /// Directory for session recordings
    #[arg(long, default_value = "casts")]
    log_dir: PathBuf,

    /// Maximum simultaneous clients
    #[arg(long, default_value_t = 10)]
    max_clients: usize,

    /// Server version to advertise; empty means probe the upstream
    #[arg(long, default_value = "")]
    server_version: String,

    /// Handshake and connect timeout, in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Global request types to forward without logging, comma-separated
    #[arg(long, default_value = "hostkeys-00@openssh.com")]
    silent_global: String,

    /// Channel request types to forward without logging, comma-separated
    #[arg(long, default_value = "winadj@putty.projects.tartarus.org")]
    silent_channel: String,

    /// Preauth banner; unset means probe the upstream
    #[arg(long)]
    banner: Option<String>,

    /// Allowed credentials, user:pass,user:pass,...
    #[arg(long, default_value = "root:root")]
    credentials: String,

    /// Recording byte cap per channel
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_cast_bytes: u64,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    if args.max_clients == 0 {
        return Err(ConfigError::ZeroMaxClients.into());
    }
    let credentials = Credentials::parse(&args.credentials)?;
    info!("Accepting passwords for {} users", credentials.user_count());

    let timeout = Duration::from_secs(args.timeout);
    let upstream_addr = ensure_ssh_port(&args.upstream);

    let host_key = keys::load_or_create_key(&args.host_key)?;
    let client_key = Arc::new(keys::load_or_create_key(&args.client_key)?);
    let upstream_host_key =
        keys::load_or_fetch_host_key(&args.upstream_host_key, &upstream_addr, timeout).await?;

    let server_version = if args.server_version.is_empty() {
        let version = probe::probe_server_version(&upstream_addr, timeout)
            .await
            .with_context(|| format!("failed to probe version of {}", upstream_addr))?;
        info!("Probed upstream version {:?}", version);
        version
    } else {
        args.server_version
    };

    let banner = match args.banner {
        Some(banner) => Some(banner),
        None => match probe::probe_auth_banner(&upstream_addr, &args.upstream_user, timeout).await
        {
            Ok(Some(banner)) => {
                info!("Probed upstream banner ({} bytes)", banner.len());
                Some(banner)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("Banner probe failed: {:#}", err);
                None
            }
        },
    };

    if !args.log_dir.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&args.log_dir)
            .with_context(|| format!("failed to create {}", args.log_dir.display()))?;
    }

    let config = Arc::new(ProxyConfig {
        upstream_addr,
        upstream_user: args.upstream_user,
        server_version: server_version.clone(),
        banner,
        credentials,
        silent: SilentSet::parse(&args.silent_global, &args.silent_channel),
        timeout,
        log_dir: args.log_dir,
        max_cast_bytes: args.max_cast_bytes,
        client_key,
        upstream_host_key,
    });
    let server_config = Arc::new(ssh::make_server_config(&server_version, host_key));
    let ctx = Arc::new(SessionContext {
        config,
        server_config,
    });

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, ctx, args.max_clients).await
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("sshtrap=info".parse()?);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr.and(Arc::new(file)))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
