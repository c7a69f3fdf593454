//! SSH proxy engine
//!
//! Server role towards attackers, client role towards the victim, and the
//! relay machinery between them.

pub mod channel;
pub mod handler;
pub mod proxy;
pub mod session;
pub mod upstream;

use std::borrow::Cow;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::{server, MethodSet, Preferred, SshId};

/// Broad algorithm lists for both roles. A honeypot wants to speak to as
/// many client implementations as possible, so everything russh offers is
/// on the table, weak legacy algorithms included.
pub fn broad_preferred() -> Preferred {
    Preferred {
        kex: Cow::Borrowed(&[
            russh::kex::CURVE25519,
            russh::kex::CURVE25519_PRE_RFC_8731,
            russh::kex::ECDH_SHA2_NISTP256,
            russh::kex::ECDH_SHA2_NISTP384,
            russh::kex::ECDH_SHA2_NISTP521,
            russh::kex::DH_G16_SHA512,
            russh::kex::DH_G14_SHA256,
            russh::kex::DH_GEX_SHA256,
            russh::kex::DH_GEX_SHA1,
            russh::kex::DH_G14_SHA1,
            russh::kex::DH_G1_SHA1,
        ]),
        cipher: Cow::Borrowed(&[
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_256_GCM,
            russh::cipher::AES_128_GCM,
            russh::cipher::AES_256_CTR,
            russh::cipher::AES_192_CTR,
            russh::cipher::AES_128_CTR,
            russh::cipher::AES_256_CBC,
            russh::cipher::AES_192_CBC,
            russh::cipher::AES_128_CBC,
        ]),
        ..Preferred::default()
    }
}

/// Server-role configuration shared by every accepted connection.
///
/// All auth methods are advertised; the handler decides what they do.
/// Rejection delays are kept minimal so brute-forcers keep talking.
pub fn make_server_config(version: &str, host_key: PrivateKey) -> server::Config {
    server::Config {
        server_id: SshId::Standard(version.to_string()),
        keys: vec![host_key],
        preferred: broad_preferred(),
        methods: MethodSet::all(),
        auth_rejection_time: Duration::from_millis(100),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: Some(Duration::from_secs(3600)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_advertises_version() {
        let key = PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
            .unwrap();
        let config = make_server_config("SSH-2.0-OpenSSH_7.2", key);
        match config.server_id {
            SshId::Standard(ref id) => assert_eq!(id, "SSH-2.0-OpenSSH_7.2"),
            _ => panic!("expected standard id"),
        }
        assert_eq!(config.keys.len(), 1);
    }

    #[test]
    fn test_broad_preferred_keeps_legacy_ciphers() {
        let preferred = broad_preferred();
        assert!(preferred.cipher.contains(&russh::cipher::CHACHA20_POLY1305));
        assert!(preferred.cipher.contains(&russh::cipher::AES_128_CBC));
        assert!(preferred.kex.contains(&russh::kex::DH_G1_SHA1));
    }
}
