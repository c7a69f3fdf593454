//! Channel pair relay
//!
//! Every accepted channel is mirrored on the opposite endpoint and relayed
//! by a single task: commands from the client side (fed in FIFO order by
//! the server handler) and messages from the upstream channel meet in one
//! biased select, requests ahead of data so a burst of output can never
//! starve a shell request. Client-bound writes go through `ChannelWriter`,
//! a small forwarder task, so a pair never blocks on the client's session
//! loop.

use std::collections::VecDeque;
use std::sync::Arc;

use russh::{client, server, Channel, ChannelId, ChannelMsg, CryptoVec, Sig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::recorder::{PtyParams, SessionRecorder};
use crate::ssh::proxy::ChannelRequest;
use crate::tag::FlowDirection;

/// Work sent to a channel pair by the session controller.
#[derive(Debug)]
pub enum PairCommand {
    Data(Vec<u8>),
    ExtendedData { ext: u32, data: Vec<u8> },
    Request {
        request: ChannelRequest,
        reply: Option<oneshot::Sender<bool>>,
    },
    Eof,
    Close,
}

enum WriteOp {
    Data(ChannelId, CryptoVec),
    Extended(ChannelId, u32, CryptoVec),
    Eof(ChannelId),
    Close(ChannelId),
    ExitStatus(ChannelId, u32),
    ExitSignal(ChannelId, Sig, bool, String, String),
}

/// Fire-and-forget writer for client-bound channel traffic.
///
/// Operations are queued to a forwarder task that performs them on the
/// server handle; failures mean the client session is gone and are simply
/// dropped.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl ChannelWriter {
    pub fn spawn(handle: server::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Data(id, data) => {
                        let _ = handle.data(id, data).await;
                    }
                    WriteOp::Extended(id, ext, data) => {
                        let _ = handle.extended_data(id, ext, data).await;
                    }
                    WriteOp::Eof(id) => {
                        let _ = handle.eof(id).await;
                    }
                    WriteOp::Close(id) => {
                        let _ = handle.close(id).await;
                    }
                    WriteOp::ExitStatus(id, status) => {
                        let _ = handle.exit_status_request(id, status).await;
                    }
                    WriteOp::ExitSignal(id, signal, core, message, lang) => {
                        let _ = handle
                            .exit_signal_request(id, signal, core, message, lang)
                            .await;
                    }
                }
            }
        });
        ChannelWriter { tx }
    }

    pub fn data(&self, id: ChannelId, bytes: &[u8]) {
        let _ = self.tx.send(WriteOp::Data(id, CryptoVec::from_slice(bytes)));
    }

    pub fn extended_data(&self, id: ChannelId, ext: u32, bytes: &[u8]) {
        let _ = self
            .tx
            .send(WriteOp::Extended(id, ext, CryptoVec::from_slice(bytes)));
    }

    pub fn eof(&self, id: ChannelId) {
        let _ = self.tx.send(WriteOp::Eof(id));
    }

    pub fn close(&self, id: ChannelId) {
        let _ = self.tx.send(WriteOp::Close(id));
    }

    pub fn exit_status(&self, id: ChannelId, status: u32) {
        let _ = self.tx.send(WriteOp::ExitStatus(id, status));
    }

    pub fn exit_signal(
        &self,
        id: ChannelId,
        signal: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    ) {
        let _ = self.tx.send(WriteOp::ExitSignal(
            id,
            signal,
            core_dumped,
            error_message,
            lang_tag,
        ));
    }
}

/// One mirrored channel: client-side `ChannelId` bound to an upstream
/// channel, with its own recorder.
pub struct ChannelPair {
    tag: String,
    client_id: ChannelId,
    writer: ChannelWriter,
    recorder: SessionRecorder,
    config: Arc<ProxyConfig>,
}

impl ChannelPair {
    /// Spawn the relay task and return the command side.
    pub fn spawn(
        tag: String,
        client_id: ChannelId,
        writer: ChannelWriter,
        upstream: Channel<client::Msg>,
        recorder: SessionRecorder,
        config: Arc<ProxyConfig>,
    ) -> mpsc::UnboundedSender<PairCommand> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let pair = ChannelPair {
            tag,
            client_id,
            writer,
            recorder,
            config,
        };
        tokio::spawn(pair.run(upstream, cmd_rx));
        cmd_tx
    }

    async fn run(
        self,
        mut upstream: Channel<client::Msg>,
        mut cmd_rx: mpsc::UnboundedReceiver<PairCommand>,
    ) {
        let mut pending: VecDeque<oneshot::Sender<bool>> = VecDeque::new();

        loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(PairCommand::Close) => break,
                    Some(PairCommand::Data(data)) => {
                        self.recorder.write(FlowDirection::ClientToUpstream, &data);
                        if upstream.data(&data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(PairCommand::ExtendedData { ext, data }) => {
                        self.recorder.write(FlowDirection::ClientToUpstream, &data);
                        if upstream.extended_data(ext, &data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(PairCommand::Eof) => {
                        if upstream.eof().await.is_err() {
                            break;
                        }
                    }
                    Some(PairCommand::Request { request, reply }) => {
                        if !self.relay_request(&upstream, request, reply, &mut pending).await {
                            break;
                        }
                    }
                },
                msg = upstream.wait() => match msg {
                    None => break,
                    Some(msg) => {
                        if !self.relay_upstream(msg, &mut pending) {
                            break;
                        }
                    }
                },
            }
        }

        // Both halves close exactly once, whatever ended the pair.
        let _ = upstream.close().await;
        self.writer.close(self.client_id);
        self.recorder.close();
        for tx in pending.drain(..) {
            let _ = tx.send(false);
        }
        debug!("[{}] Channel pair closed", self.tag);
    }

    /// Inspect, log, and forward one channel request. Returns false when
    /// the pair must end.
    async fn relay_request(
        &self,
        upstream: &Channel<client::Msg>,
        request: ChannelRequest,
        reply: Option<oneshot::Sender<bool>>,
        pending: &mut VecDeque<oneshot::Sender<bool>>,
    ) -> bool {
        let name = request.wire_name();
        if !self.config.silent.channel_is_silent(name) {
            let detail = request.describe();
            if detail.is_empty() {
                info!("[{}] Request {}", self.tag, name);
            } else {
                info!("[{}] Request {} {}", self.tag, name, detail);
            }
        }

        match &request {
            ChannelRequest::Pty {
                term,
                col_width,
                row_height,
                ..
            } => {
                let params = PtyParams {
                    term: term.clone(),
                    width: *col_width,
                    height: *row_height,
                };
                match self.recorder.set_pty(params) {
                    Ok(()) => info!(
                        "[{}] Terminal: {:?} {}x{}",
                        self.tag, term, col_width, row_height
                    ),
                    Err(err) => debug!("[{}] pty not captured: {}", self.tag, err),
                }
            }
            ChannelRequest::Shell => {
                if let Err(err) = self.recorder.start(None) {
                    debug!("[{}] recording not started: {}", self.tag, err);
                }
            }
            ChannelRequest::Exec { command } => {
                let command = String::from_utf8_lossy(command).into_owned();
                if let Err(err) = self.recorder.start(Some(command)) {
                    debug!("[{}] recording not started: {}", self.tag, err);
                }
            }
            _ => {}
        }

        if let Err(err) = request.forward(upstream).await {
            warn!("[{}] Request {} forward failed: {}", self.tag, name, err);
            if let Some(tx) = reply {
                let _ = tx.send(false);
            }
            return false;
        }
        if let Some(tx) = reply {
            pending.push_back(tx);
        }
        true
    }

    /// Relay one upstream channel message to the client. Returns false
    /// when the pair must end.
    fn relay_upstream(
        &self,
        msg: ChannelMsg,
        pending: &mut VecDeque<oneshot::Sender<bool>>,
    ) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.recorder.write(FlowDirection::UpstreamToClient, &data);
                self.writer.data(self.client_id, &data);
            }
            ChannelMsg::ExtendedData { data, ext } => {
                self.recorder.write(FlowDirection::UpstreamToClient, &data);
                self.writer.extended_data(self.client_id, ext, &data);
            }
            ChannelMsg::Eof => self.writer.eof(self.client_id),
            ChannelMsg::Close => return false,
            ChannelMsg::Success => {
                if let Some(tx) = pending.pop_front() {
                    let _ = tx.send(true);
                }
            }
            ChannelMsg::Failure => {
                if let Some(tx) = pending.pop_front() {
                    let _ = tx.send(false);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.writer.exit_status(self.client_id, exit_status);
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                self.writer.exit_signal(
                    self.client_id,
                    signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                );
            }
            other => debug!("[{}] upstream channel message {:?}", self.tag, other),
        }
        true
    }
}

/// Relay for a channel the upstream opened towards the client
/// (forwarded-tcpip, x11, agent). Both halves are retained channel
/// objects, so the pump is symmetric; nothing here records, these are
/// never interactive sessions.
pub fn spawn_linked(
    tag: String,
    mut client_side: Channel<server::Msg>,
    mut upstream_side: Channel<client::Msg>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = client_side.wait() => match msg {
                    None | Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::Data { data }) => {
                        if upstream_side.data(&data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if upstream_side.extended_data(ext, &data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = upstream_side.eof().await;
                    }
                    Some(msg) => debug!("[{}] client channel message {:?}", tag, msg),
                },
                msg = upstream_side.wait() => match msg {
                    None | Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::Data { data }) => {
                        if client_side.data(&data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if client_side.extended_data(ext, &data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = client_side.eof().await;
                    }
                    Some(msg) => debug!("[{}] upstream channel message {:?}", tag, msg),
                },
            }
        }
        let _ = client_side.close().await;
        let _ = upstream_side.close().await;
        debug!("[{}] Linked channel closed", tag);
    });
}
