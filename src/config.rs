//! Proxy configuration
//!
//! Everything here is resolved once at startup and then shared read-only
//! (`Arc<ProxyConfig>`) with every session. Nothing mutates after startup.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey};
use thiserror::Error;

/// Errors produced while turning CLI values into a usable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Credential list entry without a `user:password` separator.
    #[error("invalid credential entry {0:?} (expected user:password)")]
    InvalidCredential(String),

    /// No usable credential was supplied.
    #[error("no credentials configured")]
    NoCredentials,

    /// Zero max clients would accept nobody.
    #[error("max clients must be greater than zero")]
    ZeroMaxClients,
}

/// The password allow-list: username to the set of passwords accepted
/// for it. Membership is the sole acceptance criterion.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    by_user: HashMap<String, HashSet<String>>,
}

impl Credentials {
    /// Parse a `user:pass,user:pass,...` list. Entries without a colon are
    /// rejected; an empty result is an error because the honeypot could
    /// never let anyone in.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut by_user: HashMap<String, HashSet<String>> = HashMap::new();
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (user, pass) = entry
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidCredential(entry.to_string()))?;
            by_user
                .entry(user.to_string())
                .or_default()
                .insert(pass.to_string());
        }
        if by_user.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        Ok(Credentials { by_user })
    }

    /// Whether this exact user/password pair is allowed in.
    pub fn allows(&self, user: &str, password: &str) -> bool {
        self.by_user
            .get(user)
            .is_some_and(|passwords| passwords.contains(password))
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }
}

/// Request types that are forwarded but kept out of the logs.
#[derive(Clone, Debug, Default)]
pub struct SilentSet {
    global: HashSet<String>,
    channel: HashSet<String>,
}

impl SilentSet {
    /// Build from two comma-separated lists of request type names.
    pub fn parse(global: &str, channel: &str) -> Self {
        fn split(list: &str) -> HashSet<String> {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }
        SilentSet {
            global: split(global),
            channel: split(channel),
        }
    }

    pub fn global_is_silent(&self, request_type: &str) -> bool {
        self.global.contains(request_type)
    }

    pub fn channel_is_silent(&self, request_type: &str) -> bool {
        self.channel.contains(request_type)
    }
}

/// Immutable per-process configuration consumed by every session.
pub struct ProxyConfig {
    /// Upstream victim address, always with a port.
    pub upstream_addr: String,
    /// Username presented to the upstream server.
    pub upstream_user: String,
    /// Version string advertised to clients (probed from upstream when not
    /// configured).
    pub server_version: String,
    /// Preauth banner sent to clients, if any.
    pub banner: Option<String>,
    /// Password allow-list.
    pub credentials: Credentials,
    /// Request types to forward without logging.
    pub silent: SilentSet,
    /// Handshake and connect budget for either endpoint.
    pub timeout: Duration,
    /// Directory receiving asciicast recordings.
    pub log_dir: PathBuf,
    /// Cap on recorded event bytes per channel.
    pub max_cast_bytes: u64,
    /// Key used to authenticate against the upstream server.
    pub client_key: Arc<PrivateKey>,
    /// Pinned upstream host key (TOFU).
    pub upstream_host_key: PublicKey,
}

/// Append the default SSH port to an address that lacks one.
///
/// Bracketed IPv6 literals and anything already carrying a port are left
/// untouched.
pub fn ensure_ssh_port(addr: &str) -> String {
    if addr.starts_with('[') {
        // [::1] or [::1]:2222
        if addr.contains("]:") {
            return addr.to_string();
        }
        return format!("{}:22", addr);
    }
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:22", addr)
    }
}

/// Host portion of an `addr:port` string, for prompts and log lines.
pub fn host_of(addr: &str) -> &str {
    if let Some(end) = addr.find("]:") {
        return &addr[..end + 1];
    }
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_parse_single() {
        let creds = Credentials::parse("root:root").unwrap();
        assert!(creds.allows("root", "root"));
        assert!(!creds.allows("root", "toor"));
        assert!(!creds.allows("admin", "root"));
    }

    #[test]
    fn test_credentials_parse_multiple_and_shared_user() {
        let creds = Credentials::parse("root:root,root:123456,admin:admin").unwrap();
        assert!(creds.allows("root", "root"));
        assert!(creds.allows("root", "123456"));
        assert!(creds.allows("admin", "admin"));
        assert!(!creds.allows("admin", "123456"));
        assert_eq!(creds.user_count(), 2);
    }

    #[test]
    fn test_credentials_password_may_contain_colon() {
        let creds = Credentials::parse("root:a:b").unwrap();
        assert!(creds.allows("root", "a:b"));
    }

    #[test]
    fn test_credentials_empty_is_error() {
        assert!(matches!(
            Credentials::parse(""),
            Err(ConfigError::NoCredentials)
        ));
        assert!(matches!(
            Credentials::parse(" , ,"),
            Err(ConfigError::NoCredentials)
        ));
    }

    #[test]
    fn test_credentials_missing_separator_is_error() {
        assert!(matches!(
            Credentials::parse("root"),
            Err(ConfigError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_silent_set_membership() {
        let silent = SilentSet::parse(
            "hostkeys-00@openssh.com, no-more-sessions@openssh.com",
            "winadj@putty.projects.tartarus.org",
        );
        assert!(silent.global_is_silent("hostkeys-00@openssh.com"));
        assert!(silent.global_is_silent("no-more-sessions@openssh.com"));
        assert!(!silent.global_is_silent("tcpip-forward"));
        assert!(silent.channel_is_silent("winadj@putty.projects.tartarus.org"));
        assert!(!silent.channel_is_silent("shell"));
    }

    #[test]
    fn test_silent_set_empty() {
        let silent = SilentSet::parse("", "");
        assert!(!silent.global_is_silent("tcpip-forward"));
        assert!(!silent.channel_is_silent("pty-req"));
    }

    #[test]
    fn test_ensure_ssh_port() {
        assert_eq!(ensure_ssh_port("10.0.0.2"), "10.0.0.2:22");
        assert_eq!(ensure_ssh_port("10.0.0.2:2222"), "10.0.0.2:2222");
        assert_eq!(ensure_ssh_port("victim.example"), "victim.example:22");
        assert_eq!(ensure_ssh_port("[::1]"), "[::1]:22");
        assert_eq!(ensure_ssh_port("[::1]:2222"), "[::1]:2222");
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.2:22"), "10.0.0.2");
        assert_eq!(host_of("victim.example:2222"), "victim.example");
        assert_eq!(host_of("[::1]:22"), "[::1]");
    }
}
