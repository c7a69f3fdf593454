//! Client-side SSH handler
//!
//! The server-role handler for one accepted connection. It owns no proxy
//! state: auth attempts are checked against the allow-list and logged
//! here, everything else is converted into `HandlerEvent`s for the session
//! controller, with a oneshot reply where russh needs an answer before the
//! callback returns.

use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{host_of, ProxyConfig};
use crate::ssh::proxy::ChannelRequest;
use crate::tag::SessionTag;

/// What the handler tells the session controller.
#[derive(Debug)]
pub enum HandlerEvent {
    Authenticated {
        user: String,
    },
    ChannelOpenSession {
        id: ChannelId,
        reply: oneshot::Sender<bool>,
    },
    ChannelOpenDirectTcpip {
        id: ChannelId,
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
        reply: oneshot::Sender<bool>,
    },
    Request {
        id: ChannelId,
        request: ChannelRequest,
        reply: Option<oneshot::Sender<bool>>,
    },
    Data {
        id: ChannelId,
        data: Vec<u8>,
    },
    ExtendedData {
        id: ChannelId,
        ext: u32,
        data: Vec<u8>,
    },
    Eof {
        id: ChannelId,
    },
    Close {
        id: ChannelId,
    },
    TcpipForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Option<u32>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<bool>,
    },
}

pub struct ClientHandler {
    tag: SessionTag,
    config: Arc<ProxyConfig>,
    events: mpsc::UnboundedSender<HandlerEvent>,
    client_version: Arc<OnceLock<String>>,
}

impl ClientHandler {
    pub fn new(
        tag: SessionTag,
        config: Arc<ProxyConfig>,
        events: mpsc::UnboundedSender<HandlerEvent>,
        client_version: Arc<OnceLock<String>>,
    ) -> Self {
        ClientHandler {
            tag,
            config,
            events,
            client_version,
        }
    }

    /// Allow-list check shared by password and keyboard-interactive auth.
    fn check_password(&self, user: &str, password: &str) -> Auth {
        let ok = self.config.credentials.allows(user, password);
        info!(
            "[{}] Authentication {:?} / {:?}{}",
            self.tag,
            user,
            password,
            if ok { "" } else { " (failed)" }
        );
        if ok {
            let _ = self.events.send(HandlerEvent::Authenticated {
                user: user.to_string(),
            });
            Auth::Accept
        } else {
            Auth::reject()
        }
    }

    /// Forward a channel request that expects an answer and relay the
    /// upstream's verdict to the client.
    async fn relay_request_with_reply(
        &mut self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        let sent = self.events.send(HandlerEvent::Request {
            id: channel,
            request,
            reply: Some(tx),
        });
        let ok = sent.is_ok() && rx.await.unwrap_or(false);
        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(ok)
    }

    /// Forward a channel request that gets no reply.
    fn relay_request(&mut self, channel: ChannelId, request: ChannelRequest) {
        let _ = self.events.send(HandlerEvent::Request {
            id: channel,
            request,
            reply: None,
        });
    }
}

impl server::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        let version = self.client_version.get().cloned().unwrap_or_default();
        info!("[{}] Connected ({})", self.tag, version);
        Ok(self.config.banner.clone())
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        info!("[{}] Authentication {:?} / (none) (failed)", self.tag, user);
        Ok(Auth::reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.check_password(user, password))
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        info!(
            "[{}] Authentication {:?} / key {} {} (failed)",
            self.tag,
            user,
            public_key.algorithm(),
            public_key.public_key_base64()
        );
        Ok(Auth::reject())
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Keys are never accepted; the offer was already logged.
        Ok(Auth::reject())
    }

    async fn auth_keyboard_interactive<'a>(
        &'a mut self,
        user: &str,
        _submethods: &str,
        response: Option<server::Response<'a>>,
    ) -> Result<Auth, Self::Error> {
        match response.and_then(|mut answers| answers.next()) {
            None => {
                let prompt = format!(
                    "{}@{}'s password: ",
                    user,
                    host_of(&self.config.upstream_addr)
                );
                Ok(Auth::Partial {
                    name: Cow::Borrowed(""),
                    instructions: Cow::Borrowed(""),
                    prompts: Cow::Owned(vec![(Cow::Owned(prompt), false)]),
                })
            }
            Some(answer) => {
                let password = String::from_utf8_lossy(&answer).into_owned();
                Ok(self.check_password(user, &password))
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(HandlerEvent::ChannelOpenSession {
                id: channel.id(),
                reply: tx,
            })
            .is_err()
        {
            return Ok(false);
        }
        Ok(rx.await.unwrap_or(false))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(HandlerEvent::ChannelOpenDirectTcpip {
                id: channel.id(),
                host: host_to_connect.to_string(),
                port: port_to_connect,
                originator: originator_address.to_string(),
                originator_port,
                reply: tx,
            })
            .is_err()
        {
            return Ok(false);
        }
        Ok(rx.await.unwrap_or(false))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Client-opened X11 channels have no upstream counterpart in the
        // SSH client role.
        warn!(
            "[{}] Rejecting client-opened x11 channel from {}:{}",
            self.tag, originator_address, originator_port
        );
        Ok(false)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            "[{}] Rejecting direct-streamlocal channel to {:?}",
            self.tag, socket_path
        );
        Ok(false)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send(HandlerEvent::Data {
            id: channel,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send(HandlerEvent::ExtendedData {
            id: channel,
            ext: code,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send(HandlerEvent::Eof { id: channel });
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.events.send(HandlerEvent::Close { id: channel });
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.relay_request_with_reply(channel, request, session)
            .await?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request_with_reply(channel, ChannelRequest::Shell, session)
            .await?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Exec {
            command: data.to_vec(),
        };
        self.relay_request_with_reply(channel, request, session)
            .await?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Subsystem {
            name: name.to_string(),
        };
        self.relay_request_with_reply(channel, request, session)
            .await?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(
            channel,
            ChannelRequest::Env {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            },
        );
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(
            channel,
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        );
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(channel, ChannelRequest::Signal { signal });
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::X11 {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen: x11_screen_number,
        };
        self.relay_request_with_reply(channel, request, session)
            .await?;
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let ok = self
            .relay_request_with_reply(channel, ChannelRequest::AgentForward, session)
            .await?;
        Ok(ok)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(HandlerEvent::TcpipForward {
                address: address.to_string(),
                port: *port,
                reply: tx,
            })
            .is_err()
        {
            return Ok(false);
        }
        match rx.await.unwrap_or(None) {
            Some(bound) => {
                *port = bound;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(HandlerEvent::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply: tx,
            })
            .is_err()
        {
            return Ok(false);
        }
        Ok(rx.await.unwrap_or(false))
    }
}
