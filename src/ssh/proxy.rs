//! Typed request forwarding
//!
//! russh hands requests to handler callbacks already parsed, so the proxy
//! carries them between endpoints as typed values rather than raw
//! payloads. Anything with a `forward` here is a valid peer operation on
//! the upstream channel; the session controller forwards global requests
//! through the upstream connection handle instead.

use russh::client;
use russh::{Channel, Pty, Sig};

/// A channel-scoped request on its way to the other side.
#[derive(Debug)]
pub enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        signal: Sig,
    },
    X11 {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen: u32,
    },
    AgentForward,
}

impl ChannelRequest {
    /// The SSH wire name, used for logging and silent-set lookups.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Signal { .. } => "signal",
            ChannelRequest::X11 { .. } => "x11-req",
            ChannelRequest::AgentForward => "auth-agent-req@openssh.com",
        }
    }

    /// Whether the requester expects a reply, per OpenSSH convention.
    /// Replies are correlated FIFO against this flag.
    pub fn wants_reply(&self) -> bool {
        !matches!(
            self,
            ChannelRequest::Env { .. }
                | ChannelRequest::WindowChange { .. }
                | ChannelRequest::Signal { .. }
        )
    }

    /// Short human-readable detail for log lines.
    pub fn describe(&self) -> String {
        match self {
            ChannelRequest::Pty {
                term,
                col_width,
                row_height,
                ..
            } => format!("{:?} {}x{}", term, col_width, row_height),
            ChannelRequest::Shell => String::new(),
            ChannelRequest::Exec { command } => {
                format!("{:?}", String::from_utf8_lossy(command))
            }
            ChannelRequest::Subsystem { name } => format!("{:?}", name),
            ChannelRequest::Env { name, value } => format!("{}={:?}", name, value),
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                ..
            } => format!("{}x{}", col_width, row_height),
            ChannelRequest::Signal { signal } => format!("{:?}", signal),
            ChannelRequest::X11 { auth_protocol, .. } => format!("{:?}", auth_protocol),
            ChannelRequest::AgentForward => String::new(),
        }
    }

    /// Send this request on the counterpart channel.
    pub async fn forward(&self, channel: &Channel<client::Msg>) -> Result<(), russh::Error> {
        let want_reply = self.wants_reply();
        match self {
            ChannelRequest::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                channel
                    .request_pty(
                        want_reply,
                        term,
                        *col_width,
                        *row_height,
                        *pix_width,
                        *pix_height,
                        modes,
                    )
                    .await
            }
            ChannelRequest::Shell => channel.request_shell(want_reply).await,
            ChannelRequest::Exec { command } => channel.exec(want_reply, command.as_slice()).await,
            ChannelRequest::Subsystem { name } => {
                channel.request_subsystem(want_reply, name).await
            }
            ChannelRequest::Env { name, value } => {
                channel.set_env(want_reply, name, value).await
            }
            ChannelRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                channel
                    .window_change(*col_width, *row_height, *pix_width, *pix_height)
                    .await
            }
            ChannelRequest::Signal { signal } => channel.signal(signal.clone()).await,
            ChannelRequest::X11 {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen,
            } => {
                channel
                    .request_x11(
                        want_reply,
                        *single_connection,
                        auth_protocol,
                        auth_cookie,
                        *screen,
                    )
                    .await
            }
            ChannelRequest::AgentForward => channel.agent_forward(want_reply).await,
        }
    }
}

/// A connection-scoped request on its way to the other side.
#[derive(Debug)]
pub enum GlobalRequest {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
}

impl GlobalRequest {
    pub fn wire_name(&self) -> &'static str {
        match self {
            GlobalRequest::TcpipForward { .. } => "tcpip-forward",
            GlobalRequest::CancelTcpipForward { .. } => "cancel-tcpip-forward",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            GlobalRequest::TcpipForward { address, port }
            | GlobalRequest::CancelTcpipForward { address, port } => {
                format!("{}:{}", address, port)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let pty = ChannelRequest::Pty {
            term: "xterm".into(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            modes: Vec::new(),
        };
        assert_eq!(pty.wire_name(), "pty-req");
        assert_eq!(ChannelRequest::Shell.wire_name(), "shell");
        assert_eq!(
            ChannelRequest::Exec { command: b"ls".to_vec() }.wire_name(),
            "exec"
        );
        assert_eq!(
            ChannelRequest::AgentForward.wire_name(),
            "auth-agent-req@openssh.com"
        );
        assert_eq!(
            GlobalRequest::TcpipForward {
                address: "0.0.0.0".into(),
                port: 8080
            }
            .wire_name(),
            "tcpip-forward"
        );
    }

    #[test]
    fn test_reply_conventions() {
        assert!(ChannelRequest::Shell.wants_reply());
        assert!(ChannelRequest::Exec { command: vec![] }.wants_reply());
        assert!(ChannelRequest::Subsystem { name: "sftp".into() }.wants_reply());
        assert!(!ChannelRequest::Env {
            name: "LANG".into(),
            value: "C".into()
        }
        .wants_reply());
        assert!(!ChannelRequest::WindowChange {
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0
        }
        .wants_reply());
        assert!(!ChannelRequest::Signal { signal: Sig::INT }.wants_reply());
    }

    #[test]
    fn test_describe_is_greppable() {
        let exec = ChannelRequest::Exec {
            command: b"uname -a".to_vec(),
        };
        assert_eq!(exec.describe(), "\"uname -a\"");

        let pty = ChannelRequest::Pty {
            term: "xterm-256color".into(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            modes: Vec::new(),
        };
        assert_eq!(pty.describe(), "\"xterm-256color\" 80x24");
    }
}
