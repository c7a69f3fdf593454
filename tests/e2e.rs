//! End-to-end proxy tests
//!
//! Everything runs in-process: a stub upstream SSH server, the proxy
//! serving a loopback listener, and a russh client playing the attacker.
//! The scenarios follow the observable contract: recorded shell output,
//! exec command capture, credential rejection without upstream contact,
//! upstream channel refusal, handshake timeout, recording cap.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{client, Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use sshtrap::config::{Credentials, ProxyConfig, SilentSet};
use sshtrap::ssh::session::{serve, SessionContext};

// ============================================================================
// Stub upstream server
// ============================================================================

struct StubBehavior {
    shell_output: Vec<u8>,
    exec_output: Vec<u8>,
    refuse_sessions: bool,
}

impl Default for StubBehavior {
    fn default() -> Self {
        StubBehavior {
            shell_output: b"hello\n".to_vec(),
            exec_output: b"Linux honeypot 6.1.0 x86_64 GNU/Linux\n".to_vec(),
            refuse_sessions: false,
        }
    }
}

#[derive(Clone)]
struct StubUpstream {
    connections: Arc<AtomicUsize>,
    behavior: Arc<StubBehavior>,
}

impl server::Server for StubUpstream {
    type Handler = StubHandler;

    fn new_client(&mut self, _peer: Option<SocketAddr>) -> StubHandler {
        self.connections.fetch_add(1, Ordering::SeqCst);
        StubHandler {
            behavior: self.behavior.clone(),
        }
    }
}

struct StubHandler {
    behavior: Arc<StubBehavior>,
}

impl server::Handler for StubHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(!self.behavior.refuse_sessions)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let _ = session.data(channel, CryptoVec::from_slice(&self.behavior.shell_output));
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let _ = session.data(channel, CryptoVec::from_slice(&self.behavior.exec_output));
        let _ = session.exit_status_request(channel, 0);
        let _ = session.close(channel);
        Ok(())
    }
}

async fn start_stub(behavior: StubBehavior) -> Result<(SocketAddr, PublicKey, Arc<AtomicUsize>)> {
    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
    let public = key.public_key().clone();
    let config = Arc::new(server::Config {
        keys: vec![key],
        auth_rejection_time: Duration::from_millis(1),
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicUsize::new(0));
    let mut stub = StubUpstream {
        connections: connections.clone(),
        behavior: Arc::new(behavior),
    };
    tokio::spawn(async move {
        let _ = stub.run_on_socket(config, &listener).await;
    });
    Ok((addr, public, connections))
}

// ============================================================================
// Proxy under test
// ============================================================================

struct TestProxy {
    addr: SocketAddr,
    log_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

async fn start_proxy(
    upstream: SocketAddr,
    upstream_host_key: PublicKey,
    max_cast_bytes: u64,
    timeout: Duration,
) -> Result<TestProxy> {
    let tmp = tempfile::tempdir()?;
    let host_key = sshtrap::keys::load_or_create_key(&tmp.path().join("host_key"))?;
    let client_key = Arc::new(sshtrap::keys::load_or_create_key(
        &tmp.path().join("client_key"),
    )?);
    let log_dir = tmp.path().join("casts");

    let config = Arc::new(ProxyConfig {
        upstream_addr: upstream.to_string(),
        upstream_user: "root".to_string(),
        server_version: "SSH-2.0-OpenSSH_7.2".to_string(),
        banner: None,
        credentials: Credentials::parse("root:root").unwrap(),
        silent: SilentSet::parse("", ""),
        timeout,
        log_dir: log_dir.clone(),
        max_cast_bytes,
        client_key,
        upstream_host_key,
    });
    let server_config = Arc::new(sshtrap::ssh::make_server_config(
        "SSH-2.0-OpenSSH_7.2",
        host_key,
    ));
    let ctx = Arc::new(SessionContext {
        config,
        server_config,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = serve(listener, ctx, 4).await;
    });

    Ok(TestProxy {
        addr,
        log_dir,
        _tmp: tmp,
    })
}

// ============================================================================
// Test client
// ============================================================================

struct AcceptAll;

impl client::Handler for AcceptAll {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn connect_client(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> Result<(client::Handle<AcceptAll>, bool)> {
    let mut session = client::connect(
        Arc::new(client::Config::default()),
        addr,
        AcceptAll,
    )
    .await
    .context("client connect failed")?;
    let auth = session
        .authenticate_password(user, password)
        .await
        .context("password auth errored")?;
    Ok((session, auth.success()))
}

/// Collect channel data until `min_bytes` arrived, the channel ended, or
/// the window expired.
async fn collect_data(channel: &mut Channel<client::Msg>, min_bytes: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if out.len() >= min_bytes {
            return out;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return out;
        }
        match tokio::time::timeout(remaining, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => out.extend_from_slice(&data),
            Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) | Ok(None) => return out,
            Ok(Some(_)) => {}
            Err(_) => return out,
        }
    }
}

/// Wait until a recording containing `needle` shows up in the log dir.
async fn wait_for_cast(dir: &Path, needle: &str) -> Result<String> {
    for _ in 0..100 {
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                let text = std::fs::read_to_string(&path)?;
                if text.contains(needle) {
                    return Ok(text);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("no recording containing {:?} appeared", needle)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_shell_session_relayed_and_recorded() -> Result<()> {
    let (upstream_addr, upstream_key, _connections) = start_stub(StubBehavior::default()).await?;
    let proxy = start_proxy(upstream_addr, upstream_key, 1 << 20, Duration::from_secs(10)).await?;

    let (session, authed) = connect_client(proxy.addr, "root", "root").await?;
    assert!(authed, "allow-listed credentials must be accepted");

    let mut channel = session.channel_open_session().await?;
    channel
        .request_pty(false, "xterm-256color", 80, 24, 0, 0, &[])
        .await?;
    channel.request_shell(false).await?;

    let output = collect_data(&mut channel, b"hello\n".len()).await;
    assert_eq!(&output[..], b"hello\n", "shell output must pass through");

    let cast = wait_for_cast(&proxy.log_dir, "hello").await?;
    let mut lines = cast.lines();

    let header: serde_json::Value = serde_json::from_str(lines.next().unwrap())?;
    assert_eq!(header["version"], 2);
    assert_eq!(header["width"], 80);
    assert_eq!(header["height"], 24);
    assert_eq!(header["env"]["TERM"], "xterm-256color");
    assert!(header["timestamp"].as_u64().unwrap() > 0);

    let event: serde_json::Value = serde_json::from_str(lines.next().unwrap())?;
    assert!(event[0].as_f64().unwrap() >= 0.0);
    assert_eq!(event[1], "o");
    assert_eq!(event[2], "hello\n");

    Ok(())
}

#[tokio::test]
async fn test_exec_command_captured_in_header() -> Result<()> {
    let (upstream_addr, upstream_key, _connections) = start_stub(StubBehavior::default()).await?;
    let proxy = start_proxy(upstream_addr, upstream_key, 1 << 20, Duration::from_secs(10)).await?;

    let (session, authed) = connect_client(proxy.addr, "root", "root").await?;
    assert!(authed);

    let mut channel = session.channel_open_session().await?;
    channel.exec(false, "uname -a").await?;

    let output = collect_data(&mut channel, b"Linux".len()).await;
    assert!(
        output.starts_with(b"Linux"),
        "exec output must pass through, got {:?}",
        String::from_utf8_lossy(&output)
    );

    let cast = wait_for_cast(&proxy.log_dir, "Linux").await?;
    let header: serde_json::Value = serde_json::from_str(cast.lines().next().unwrap())?;
    assert_eq!(header["command"], "uname -a");

    Ok(())
}

#[tokio::test]
async fn test_rejected_credentials_never_reach_upstream() -> Result<()> {
    let (upstream_addr, upstream_key, connections) = start_stub(StubBehavior::default()).await?;
    let proxy = start_proxy(upstream_addr, upstream_key, 1 << 20, Duration::from_secs(10)).await?;

    let (_session, authed) = connect_client(proxy.addr, "root", "wrongpass").await?;
    assert!(!authed, "wrong password must be rejected");

    // Give the proxy a moment to (not) dial out.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        connections.load(Ordering::SeqCst),
        0,
        "upstream must not be contacted before authentication succeeds"
    );
    Ok(())
}

#[tokio::test]
async fn test_upstream_channel_refusal_propagates() -> Result<()> {
    let behavior = StubBehavior {
        refuse_sessions: true,
        ..Default::default()
    };
    let (upstream_addr, upstream_key, _connections) = start_stub(behavior).await?;
    let proxy = start_proxy(upstream_addr, upstream_key, 1 << 20, Duration::from_secs(10)).await?;

    let (session, authed) = connect_client(proxy.addr, "root", "root").await?;
    assert!(authed);

    let result = session.channel_open_session().await;
    assert!(
        result.is_err(),
        "a channel the upstream refuses must be refused to the client"
    );
    Ok(())
}

#[tokio::test]
async fn test_client_handshake_timeout_closes_connection() -> Result<()> {
    let (upstream_addr, upstream_key, connections) = start_stub(StubBehavior::default()).await?;
    let proxy = start_proxy(upstream_addr, upstream_key, 1 << 20, Duration::from_secs(1)).await?;

    // Connect and say nothing.
    let mut stream = TcpStream::connect(proxy.addr).await?;
    let silent_client = async {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(8), silent_client)
        .await
        .context("proxy kept the silent connection open past the timeout")?;

    assert_eq!(connections.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_recording_cap_does_not_break_the_channel() -> Result<()> {
    let behavior = StubBehavior {
        shell_output: vec![b'x'; 100 * 1024],
        ..Default::default()
    };
    let (upstream_addr, upstream_key, _connections) = start_stub(behavior).await?;
    let proxy = start_proxy(upstream_addr, upstream_key, 1024, Duration::from_secs(10)).await?;

    let (session, authed) = connect_client(proxy.addr, "root", "root").await?;
    assert!(authed);

    let mut channel = session.channel_open_session().await?;
    channel.request_shell(false).await?;

    let output = collect_data(&mut channel, 100 * 1024).await;
    assert_eq!(output.len(), 100 * 1024, "the relay must not drop bytes");

    // The recording may hold anything from just the header to a few small
    // events, but never more event bytes than the cap.
    let cast = wait_for_cast(&proxy.log_dir, "\"version\":2").await?;
    let event_bytes: usize = cast.lines().skip(1).map(|l| l.len() + 1).sum();
    assert!(
        event_bytes as u64 <= 1024,
        "recorded event bytes {} exceed the cap",
        event_bytes
    );
    Ok(())
}
