//! Session controller
//!
//! One controller per accepted TCP connection. It owns both endpoints for
//! the whole session: the russh server session for the attacker and the
//! upstream client connection for the victim. Lifecycle: client handshake
//! and authentication under the timeout budget, upstream connect under the
//! same budget, then a multiplex loop over handler events, upstream events
//! and the client session future until either endpoint finishes.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, Result};
use russh::server;
use russh::{ChannelId, Disconnect};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::probe::VersionTap;
use crate::recorder::{cast_path, SessionRecorder};
use crate::ssh::channel::{self, ChannelPair, ChannelWriter, PairCommand};
use crate::ssh::handler::{ClientHandler, HandlerEvent};
use crate::ssh::proxy::GlobalRequest;
use crate::ssh::upstream::{self, UpstreamEvent, UpstreamHandle};
use crate::tag::{SessionTag, Side};

/// Process-wide state shared by every session.
pub struct SessionContext {
    pub config: Arc<ProxyConfig>,
    pub server_config: Arc<server::Config>,
}

/// Accept clients forever, one session task per connection, bounded by a
/// semaphore. The permit is released when the session task finishes,
/// whatever path it took.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    max_clients: usize,
) -> Result<()> {
    let limiter = Arc::new(Semaphore::new(max_clients));
    loop {
        let permit = limiter
            .clone()
            .acquire_owned()
            .await
            .context("client limiter closed")?;
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let tag = SessionTag::new(peer);
            run_session(stream, tag.clone(), ctx).await;
            info!("[{}] Finished", tag);
            drop(permit);
        });
    }
}

enum AuthPhase {
    Authenticated,
    Ended,
}

async fn run_session(stream: TcpStream, tag: SessionTag, ctx: Arc<SessionContext>) {
    let config = ctx.config.clone();
    info!("[{}] New connection", tag);

    let version_cell = Arc::new(OnceLock::new());
    let tap = VersionTap::new(stream, version_cell.clone());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let handler = ClientHandler::new(
        tag.clone(),
        config.clone(),
        event_tx,
        version_cell.clone(),
    );

    // One deadline covers the whole client handshake: version exchange,
    // key exchange, and authentication. Expiry drops or disconnects the
    // connection before the upstream is ever contacted.
    let deadline = tokio::time::Instant::now() + config.timeout;

    let mut client_session = match tokio::time::timeout_at(
        deadline,
        server::run_stream(ctx.server_config.clone(), tap, handler),
    )
    .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => {
            info!("[{}] Pre-auth failure: {:#}", tag, err);
            return;
        }
        Err(_) => {
            info!("[{}] Client handshake timeout", tag);
            return;
        }
    };
    let server_handle = client_session.handle();
    let mut client_done = false;

    let auth = tokio::time::timeout_at(deadline, async {
        loop {
            tokio::select! {
                ev = event_rx.recv() => match ev {
                    Some(HandlerEvent::Authenticated { user }) => {
                        info!("[{}] Authenticated as {:?}", tag, user);
                        return AuthPhase::Authenticated;
                    }
                    Some(_) => continue,
                    None => return AuthPhase::Ended,
                },
                result = &mut client_session => {
                    if let Err(err) = result {
                        debug!("[{}] Client session ended: {:#}", tag, err);
                    }
                    return AuthPhase::Ended;
                }
            }
        }
    })
    .await;

    match auth {
        Err(_) => {
            info!("[{}] Client handshake timeout", tag);
            let _ = server_handle
                .disconnect(Disconnect::ByApplication, "timeout".into(), "".into())
                .await;
            return;
        }
        Ok(AuthPhase::Ended) => {
            info!("[{}] Pre-auth disconnect", tag);
            return;
        }
        Ok(AuthPhase::Authenticated) => {}
    }

    // The upstream sees the attacker's own claimed version.
    let client_version = version_cell
        .get()
        .cloned()
        .unwrap_or_else(|| config.server_version.clone());

    let (upstream_tx, mut upstream_rx) = mpsc::unbounded_channel();
    let upstream = match tokio::time::timeout(
        config.timeout,
        upstream::connect(&config, tag.clone(), client_version, upstream_tx),
    )
    .await
    {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => {
            warn!("[{}] Upstream connection failed: {:#}", tag, err);
            let _ = server_handle
                .disconnect(Disconnect::ByApplication, "".into(), "".into())
                .await;
            return;
        }
        Err(_) => {
            warn!("[{}] Upstream handshake timeout", tag);
            let _ = server_handle
                .disconnect(Disconnect::ByApplication, "".into(), "".into())
                .await;
            return;
        }
    };

    let mut ctl = Controller {
        tag: tag.clone(),
        config,
        server_handle: server_handle.clone(),
        writer: ChannelWriter::spawn(server_handle.clone()),
        upstream,
        pairs: HashMap::new(),
        client_chan_seq: 0,
        upstream_chan_seq: 0,
        global_seq: 0,
    };

    // Multiplex until either endpoint finishes. Handler events carry
    // channel opens ahead of everything queued behind them; the biased
    // select keeps them ahead of upstream chatter.
    let side = loop {
        tokio::select! {
            biased;
            ev = event_rx.recv() => match ev {
                Some(ev) => ctl.handle_client_event(ev).await,
                None => {
                    if let Err(err) = (&mut client_session).await {
                        debug!("[{}] Client session ended: {:#}", tag, err);
                    }
                    client_done = true;
                    break Side::Client;
                }
            },
            uev = upstream_rx.recv() => match uev {
                Some(UpstreamEvent::Disconnected) | None => break Side::Upstream,
                Some(uev) => ctl.handle_upstream_event(uev),
            },
            result = &mut client_session, if !client_done => {
                if let Err(err) = result {
                    debug!("[{}] Client session ended: {:#}", tag, err);
                }
                client_done = true;
                break Side::Client;
            }
        }
    };

    // Teardown: both endpoints close on every exit path. Dropping the
    // controller drops the pair senders, which winds the pair tasks down.
    ctl.upstream.disconnect();
    drop(ctl);
    if !client_done {
        let _ = server_handle
            .disconnect(Disconnect::ByApplication, "".into(), "".into())
            .await;
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut client_session).await;
    }
    info!("[{}] Session closed ({} finished first)", tag, side);
}

struct Controller {
    tag: SessionTag,
    config: Arc<ProxyConfig>,
    server_handle: server::Handle,
    writer: ChannelWriter,
    upstream: UpstreamHandle,
    pairs: HashMap<ChannelId, mpsc::UnboundedSender<PairCommand>>,
    client_chan_seq: u64,
    upstream_chan_seq: u64,
    global_seq: u64,
}

impl Controller {
    async fn handle_client_event(&mut self, ev: HandlerEvent) {
        match ev {
            HandlerEvent::Authenticated { .. } => {}

            HandlerEvent::ChannelOpenSession { id, reply } => {
                self.client_chan_seq += 1;
                let ctag = self.tag.client_channel(self.client_chan_seq);
                match self.upstream.open_session().await {
                    Ok(upstream_channel) => {
                        info!("[{}] Session channel open", ctag);
                        self.register_pair(ctag, id, upstream_channel);
                        let _ = reply.send(true);
                    }
                    Err(err) => {
                        Self::log_open_failure(&ctag, "session", err);
                        let _ = reply.send(false);
                    }
                }
            }

            HandlerEvent::ChannelOpenDirectTcpip {
                id,
                host,
                port,
                originator,
                originator_port,
                reply,
            } => {
                self.client_chan_seq += 1;
                let ctag = self.tag.client_channel(self.client_chan_seq);
                match self
                    .upstream
                    .open_direct_tcpip(host.clone(), port, originator, originator_port)
                    .await
                {
                    Ok(upstream_channel) => {
                        info!("[{}] Direct-tcpip channel to {}:{}", ctag, host, port);
                        self.register_pair(ctag, id, upstream_channel);
                        let _ = reply.send(true);
                    }
                    Err(err) => {
                        Self::log_open_failure(&ctag, "direct-tcpip", err);
                        let _ = reply.send(false);
                    }
                }
            }

            HandlerEvent::Request { id, request, reply } => {
                self.route(id, PairCommand::Request { request, reply });
            }
            HandlerEvent::Data { id, data } => self.route(id, PairCommand::Data(data)),
            HandlerEvent::ExtendedData { id, ext, data } => {
                self.route(id, PairCommand::ExtendedData { ext, data });
            }
            HandlerEvent::Eof { id } => self.route(id, PairCommand::Eof),
            HandlerEvent::Close { id } => {
                if let Some(pair) = self.pairs.remove(&id) {
                    let _ = pair.send(PairCommand::Close);
                }
            }

            HandlerEvent::TcpipForward {
                address,
                port,
                reply,
            } => {
                let request = GlobalRequest::TcpipForward {
                    address: address.clone(),
                    port,
                };
                self.log_global(&request);
                match self.upstream.tcpip_forward(address, port).await {
                    Ok(bound) => {
                        let _ = reply.send(Some(bound));
                    }
                    Err(err) => {
                        warn!("[{}] tcpip-forward failed: {}", self.tag, err);
                        let _ = reply.send(None);
                    }
                }
            }

            HandlerEvent::CancelTcpipForward {
                address,
                port,
                reply,
            } => {
                let request = GlobalRequest::CancelTcpipForward {
                    address: address.clone(),
                    port,
                };
                self.log_global(&request);
                match self.upstream.cancel_tcpip_forward(address, port).await {
                    Ok(()) => {
                        let _ = reply.send(true);
                    }
                    Err(err) => {
                        warn!("[{}] cancel-tcpip-forward failed: {}", self.tag, err);
                        let _ = reply.send(false);
                    }
                }
            }
        }
    }

    /// Mirror a channel the upstream opened towards the client. The open
    /// confirmation is awaited in its own task so the controller stays
    /// free to answer handler events.
    fn handle_upstream_event(&mut self, ev: UpstreamEvent) {
        match ev {
            UpstreamEvent::ForwardedTcpip {
                channel,
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                self.upstream_chan_seq += 1;
                let utag = self.tag.upstream_channel(self.upstream_chan_seq);
                info!(
                    "[{}] Upstream forwarded-tcpip channel {}:{}",
                    utag, connected_address, connected_port
                );
                let handle = self.server_handle.clone();
                tokio::spawn(async move {
                    match handle
                        .channel_open_forwarded_tcpip(
                            connected_address,
                            connected_port,
                            originator_address,
                            originator_port,
                        )
                        .await
                    {
                        Ok(client_side) => channel::spawn_linked(utag, client_side, channel),
                        Err(err) => {
                            warn!("[{}] Client refused forwarded-tcpip: {}", utag, err);
                        }
                    }
                });
            }

            UpstreamEvent::X11 {
                channel,
                originator_address,
                originator_port,
            } => {
                self.upstream_chan_seq += 1;
                let utag = self.tag.upstream_channel(self.upstream_chan_seq);
                info!(
                    "[{}] Upstream x11 channel from {}:{}",
                    utag, originator_address, originator_port
                );
                let handle = self.server_handle.clone();
                tokio::spawn(async move {
                    match handle
                        .channel_open_x11(originator_address, originator_port)
                        .await
                    {
                        Ok(client_side) => channel::spawn_linked(utag, client_side, channel),
                        Err(err) => warn!("[{}] Client refused x11: {}", utag, err),
                    }
                });
            }

            UpstreamEvent::AgentForward { channel } => {
                self.upstream_chan_seq += 1;
                let utag = self.tag.upstream_channel(self.upstream_chan_seq);
                info!("[{}] Upstream agent channel", utag);
                let handle = self.server_handle.clone();
                tokio::spawn(async move {
                    match handle.channel_open_agent().await {
                        Ok(client_side) => channel::spawn_linked(utag, client_side, channel),
                        Err(err) => warn!("[{}] Client refused agent channel: {}", utag, err),
                    }
                });
            }

            UpstreamEvent::Disconnected => {}
        }
    }

    fn register_pair(
        &mut self,
        ctag: String,
        id: ChannelId,
        upstream_channel: russh::Channel<russh::client::Msg>,
    ) {
        let recorder = SessionRecorder::new(
            cast_path(&self.config.log_dir, &ctag),
            ctag.clone(),
            self.config.max_cast_bytes,
        );
        let pair = ChannelPair::spawn(
            ctag,
            id,
            self.writer.clone(),
            upstream_channel,
            recorder,
            self.config.clone(),
        );
        self.pairs.insert(id, pair);
    }

    fn route(&mut self, id: ChannelId, cmd: PairCommand) {
        match self.pairs.get(&id) {
            Some(pair) => {
                if pair.send(cmd).is_err() {
                    self.pairs.remove(&id);
                }
            }
            None => {
                if let PairCommand::Request {
                    reply: Some(tx), ..
                } = cmd
                {
                    let _ = tx.send(false);
                }
            }
        }
    }

    fn log_global(&mut self, request: &GlobalRequest) {
        self.global_seq += 1;
        if !self.config.silent.global_is_silent(request.wire_name()) {
            info!(
                "[{}] Global request {} {}",
                self.tag.global_request(self.global_seq),
                request.wire_name(),
                request.describe()
            );
        }
    }

    fn log_open_failure(ctag: &str, kind: &str, err: russh::Error) {
        match err {
            russh::Error::ChannelOpenFailure(reason) => {
                warn!(
                    "[{}] Upstream refused {} channel: {:?}",
                    ctag, kind, reason
                );
            }
            err => warn!("[{}] Upstream {} channel failed: {}", ctag, kind, err),
        }
    }
}
