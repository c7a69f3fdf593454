//! Session tags for log correlation
//!
//! Every connection gets a tag derived from the client's remote address.
//! Channels and global requests get sub-tags with per-session counters so
//! a session's log lines and recording files can be grepped together.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Stable textual identifier for one client session.
///
/// Cheap to clone; every task belonging to the session holds one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTag(Arc<String>);

impl SessionTag {
    pub fn new(peer: SocketAddr) -> Self {
        SessionTag(Arc::new(peer.to_string()))
    }

    /// Sub-tag for a channel opened by the client (`-c1`, `-c2`, ...).
    pub fn client_channel(&self, seq: u64) -> String {
        format!("{}-c{}", self.0, seq)
    }

    /// Sub-tag for a channel opened by the upstream server.
    pub fn upstream_channel(&self, seq: u64) -> String {
        format!("{}-u{}", self.0, seq)
    }

    /// Sub-tag for a global request.
    pub fn global_request(&self, seq: u64) -> String {
        format!("{}-g{}", self.0, seq)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which way bytes are flowing through a channel pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowDirection {
    ClientToUpstream,
    UpstreamToClient,
}

impl FlowDirection {
    /// Direction letter used in asciicast event lines.
    pub fn cast_letter(self) -> &'static str {
        match self {
            FlowDirection::ClientToUpstream => "i",
            FlowDirection::UpstreamToClient => "o",
        }
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowDirection::ClientToUpstream => "client->upstream",
            FlowDirection::UpstreamToClient => "upstream->client",
        })
    }
}

/// Which endpoint of a session ended first, for close attribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> SessionTag {
        SessionTag::new("10.0.0.1:50000".parse().unwrap())
    }

    #[test]
    fn test_tag_is_remote_address() {
        assert_eq!(tag().to_string(), "10.0.0.1:50000");
    }

    #[test]
    fn test_sub_tags_are_distinct() {
        let t = tag();
        assert_eq!(t.client_channel(1), "10.0.0.1:50000-c1");
        assert_eq!(t.upstream_channel(1), "10.0.0.1:50000-u1");
        assert_eq!(t.global_request(3), "10.0.0.1:50000-g3");
        assert_ne!(t.client_channel(1), t.client_channel(2));
    }

    #[test]
    fn test_cast_letters() {
        assert_eq!(FlowDirection::ClientToUpstream.cast_letter(), "i");
        assert_eq!(FlowDirection::UpstreamToClient.cast_letter(), "o");
    }

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Client.to_string(), "client");
        assert_eq!(Side::Upstream.to_string(), "upstream");
    }
}
