//! Upstream endpoint
//!
//! The client-role half of a session: connect and authenticate to the
//! victim, then serialise every operation on the connection handle behind
//! a command task. The upstream handler turns server-initiated traffic
//! (forwarded-tcpip, x11, agent channels) into events for the session
//! controller, and its `Drop` doubles as the end-of-connection signal:
//! russh drops the handler exactly when the upstream session task ends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use russh::client::{self, AuthResult};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect, SshId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::ssh::broad_preferred;
use crate::tag::SessionTag;

/// Traffic initiated by the upstream server.
pub enum UpstreamEvent {
    ForwardedTcpip {
        channel: Channel<client::Msg>,
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
    X11 {
        channel: Channel<client::Msg>,
        originator_address: String,
        originator_port: u32,
    },
    AgentForward {
        channel: Channel<client::Msg>,
    },
    /// The upstream SSH session ended.
    Disconnected,
}

enum UpstreamCommand {
    OpenSession {
        reply: oneshot::Sender<Result<Channel<client::Msg>, russh::Error>>,
    },
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
        reply: oneshot::Sender<Result<Channel<client::Msg>, russh::Error>>,
    },
    TcpipForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<u32, russh::Error>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Result<(), russh::Error>>,
    },
    Disconnect,
}

/// Cheap handle for talking to the upstream connection from any task.
#[derive(Clone)]
pub struct UpstreamHandle {
    cmd_tx: mpsc::UnboundedSender<UpstreamCommand>,
}

impl UpstreamHandle {
    pub async fn open_session(&self) -> Result<Channel<client::Msg>, russh::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(UpstreamCommand::OpenSession { reply: tx })
            .is_err()
        {
            return Err(russh::Error::Disconnect);
        }
        rx.await.unwrap_or(Err(russh::Error::Disconnect))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
    ) -> Result<Channel<client::Msg>, russh::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(UpstreamCommand::OpenDirectTcpip {
                host,
                port,
                originator,
                originator_port,
                reply: tx,
            })
            .is_err()
        {
            return Err(russh::Error::Disconnect);
        }
        rx.await.unwrap_or(Err(russh::Error::Disconnect))
    }

    pub async fn tcpip_forward(&self, address: String, port: u32) -> Result<u32, russh::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(UpstreamCommand::TcpipForward {
                address,
                port,
                reply: tx,
            })
            .is_err()
        {
            return Err(russh::Error::Disconnect);
        }
        rx.await.unwrap_or(Err(russh::Error::Disconnect))
    }

    pub async fn cancel_tcpip_forward(
        &self,
        address: String,
        port: u32,
    ) -> Result<(), russh::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(UpstreamCommand::CancelTcpipForward {
                address,
                port,
                reply: tx,
            })
            .is_err()
        {
            return Err(russh::Error::Disconnect);
        }
        rx.await.unwrap_or(Err(russh::Error::Disconnect))
    }

    /// Ask the owner task to disconnect and wind down.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(UpstreamCommand::Disconnect);
    }
}

/// Connect and authenticate to the victim.
///
/// The client identifies with the attacker's own version string so the
/// upstream sees the attacker's fingerprint, verifies the host against the
/// pinned key, and authenticates with the configured client key.
pub async fn connect(
    config: &Arc<ProxyConfig>,
    tag: SessionTag,
    client_version: String,
    events: mpsc::UnboundedSender<UpstreamEvent>,
) -> Result<UpstreamHandle> {
    let ssh_config = client::Config {
        client_id: SshId::Standard(client_version),
        preferred: broad_preferred(),
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };
    let handler = UpstreamHandler {
        tag: tag.clone(),
        host_key: config.upstream_host_key.clone(),
        events,
    };

    let mut session = client::connect(
        Arc::new(ssh_config),
        config.upstream_addr.as_str(),
        handler,
    )
    .await
    .with_context(|| format!("failed to connect to {}", config.upstream_addr))?;

    let key = PrivateKeyWithHashAlg::new(config.client_key.clone(), None);
    let auth = session
        .authenticate_publickey(&config.upstream_user, key)
        .await
        .context("upstream authentication failed")?;
    match auth {
        AuthResult::Success => {}
        AuthResult::Failure { .. } => {
            anyhow::bail!(
                "upstream rejected key authentication for {:?}",
                config.upstream_user
            );
        }
    }
    info!(
        "[{}] Connected to upstream {} as {:?}",
        tag, config.upstream_addr, config.upstream_user
    );

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                UpstreamCommand::OpenSession { reply } => {
                    let _ = reply.send(session.channel_open_session().await);
                }
                UpstreamCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator,
                    originator_port,
                    reply,
                } => {
                    let _ = reply.send(
                        session
                            .channel_open_direct_tcpip(&host, port, &originator, originator_port)
                            .await,
                    );
                }
                UpstreamCommand::TcpipForward {
                    address,
                    port,
                    reply,
                } => {
                    let _ = reply.send(session.tcpip_forward(address, port).await);
                }
                UpstreamCommand::CancelTcpipForward {
                    address,
                    port,
                    reply,
                } => {
                    let _ = reply.send(
                        session
                            .cancel_tcpip_forward(address, port)
                            .await
                            .map(|_| ()),
                    );
                }
                UpstreamCommand::Disconnect => {
                    let _ = session
                        .disconnect(Disconnect::ByApplication, "", "en")
                        .await;
                    break;
                }
            }
        }
        debug!("[{}] Upstream command task finished", tag);
    });

    Ok(UpstreamHandle { cmd_tx })
}

struct UpstreamHandler {
    tag: SessionTag,
    host_key: PublicKey,
    events: mpsc::UnboundedSender<UpstreamEvent>,
}

impl Drop for UpstreamHandler {
    fn drop(&mut self) {
        // russh owns the handler; it is dropped when the upstream session
        // task ends, which is exactly the endpoint-finished signal.
        let _ = self.events.send(UpstreamEvent::Disconnected);
    }
}

impl client::Handler for UpstreamHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let ok = server_public_key.key_data() == self.host_key.key_data();
        if !ok {
            warn!(
                "[{}] Upstream host key mismatch (got {})",
                self.tag,
                server_public_key.algorithm()
            );
        }
        Ok(ok)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send(UpstreamEvent::ForwardedTcpip {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        });
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<client::Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send(UpstreamEvent::X11 {
            channel,
            originator_address: originator_address.to_string(),
            originator_port,
        });
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send(UpstreamEvent::AgentForward { channel });
        Ok(())
    }
}
