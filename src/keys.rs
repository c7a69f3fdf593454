//! Key material store
//!
//! Host and client keys are loaded from disk, or generated on first run
//! (Ed25519, OpenSSH encoding, with a `.pub` companion in authorized-keys
//! form). The upstream host key is pinned trust-on-first-use: fetched once
//! via a throwaway handshake, persisted, and verified on every later
//! connection.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use russh::client;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{decode_secret_key, Algorithm, PrivateKey, PublicKey};
use tracing::info;

/// Read a private key, or generate one (plus its `.pub`) if the file does
/// not exist yet.
pub fn load_or_create_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let key = decode_secret_key(&text, None)
            .with_context(|| format!("failed to parse key file {}", path.display()))?;
        info!("Loaded key from {}", path.display());
        return Ok(key);
    }

    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .context("failed to generate key")?;
    let encoded = key.to_openssh(LineEnding::LF).context("failed to encode key")?;
    write_restricted(path, encoded.as_bytes())?;

    let public = key.public_key();
    let public_line = public.to_openssh().context("failed to encode public key")?;
    fs::write(pub_path(path), format!("{}\n", public_line))
        .with_context(|| format!("failed to write {}", pub_path(path).display()))?;

    // Operators need the freshly generated client key to authorize it on
    // the victim, so it goes to the log.
    info!(
        "Generated key in {} (public key: {})",
        path.display(),
        public_line
    );
    Ok(key)
}

/// Load the pinned upstream host key, fetching and persisting it on first
/// sight.
pub async fn load_or_fetch_host_key(
    path: &Path,
    addr: &str,
    timeout: Duration,
) -> Result<PublicKey> {
    if path.exists() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read host key file {}", path.display()))?;
        let key = PublicKey::from_openssh(text.trim())
            .with_context(|| format!("failed to parse host key file {}", path.display()))?;
        info!("Loaded upstream host key from {}", path.display());
        return Ok(key);
    }

    let key = fetch_host_key(addr, timeout)
        .await
        .with_context(|| format!("failed to fetch host key from {}", addr))?;
    let encoded = key.to_openssh().context("failed to encode host key")?;
    write_restricted(path, format!("{}\n", encoded).as_bytes())?;
    info!(
        "Pinned upstream host key ({}) in {}",
        key.algorithm(),
        path.display()
    );
    Ok(key)
}

async fn fetch_host_key(addr: &str, timeout: Duration) -> Result<PublicKey> {
    let captured = Arc::new(Mutex::new(None));
    let handler = KeyCapture {
        captured: captured.clone(),
    };
    // The handshake is aborted on purpose once the key has been seen.
    let attempt = tokio::time::timeout(
        timeout,
        client::connect(Arc::new(client::Config::default()), addr, handler),
    )
    .await;
    match attempt {
        Err(_) => {}
        Ok(Ok(_session)) => {}
        Ok(Err(_)) => {}
    }
    let key = captured.lock().unwrap().take();
    key.context("upstream offered no host key")
}

struct KeyCapture {
    captured: Arc<Mutex<Option<PublicKey>>>,
}

impl client::Handler for KeyCapture {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        *self.captured.lock().unwrap() = Some(server_public_key.clone());
        Ok(false)
    }
}

fn pub_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".pub");
    name.into()
}

fn write_restricted(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");

        let generated = load_or_create_key(&path).unwrap();
        assert!(path.exists());
        assert!(dir.path().join("host_key.pub").exists());

        let loaded = load_or_create_key(&path).unwrap();
        assert_eq!(
            generated.public_key().to_openssh().unwrap(),
            loaded.public_key().to_openssh().unwrap()
        );
    }

    #[test]
    fn test_pub_file_is_authorized_keys_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_key");
        load_or_create_key(&path).unwrap();

        let text = fs::read_to_string(dir.path().join("client_key.pub")).unwrap();
        PublicKey::from_openssh(text.trim()).unwrap();
        assert!(text.starts_with("ssh-ed25519 "));
    }

    #[test]
    fn test_private_key_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        load_or_create_key(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_host_key_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("some_key");
        let generated = load_or_create_key(&key_path).unwrap();
        let public_line = generated.public_key().to_openssh().unwrap();

        let pin_path = dir.path().join("upstream_host_key");
        fs::write(&pin_path, format!("{}\n", public_line)).unwrap();

        // Address is never contacted when the pin already exists.
        let pinned = load_or_fetch_host_key(&pin_path, "127.0.0.1:1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pinned.to_openssh().unwrap(), public_line);
    }
}
