//! Upstream discovery and client-version capture
//!
//! When the operator leaves the advertised server version or the preauth
//! banner unconfigured, the real upstream is asked: the version comes from
//! a plain TCP read of its identification line, the banner from a
//! throwaway SSH connection whose only purpose is to elicit it.
//!
//! `VersionTap` solves the mirror-image problem on the server side: the
//! attacker's own version line is captured from the accepted TCP stream as
//! russh reads it, so the upstream connection can present it verbatim.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result};
use russh::client;
use russh::keys::PublicKey;
use russh::Disconnect;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;

/// Read the upstream's SSH identification line over plain TCP.
///
/// Servers may send other lines before the version line; anything not
/// starting with `SSH-` is skipped.
pub async fn probe_server_version(addr: &str, timeout: Duration) -> Result<String> {
    let probe = async {
        let stream = TcpStream::connect(addr).await?;
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            if line.starts_with("SSH-") {
                return Ok(line.trim_end().to_string());
            }
        }
        anyhow::bail!("upstream closed before sending a version line")
    };
    tokio::time::timeout(timeout, probe)
        .await
        .context("version probe timed out")?
}

/// Capture the upstream's preauth banner, if it sends one.
///
/// Connects, attempts `none` authentication purely to drive the server to
/// the point where banners are sent, and swallows the expected auth
/// failure. `None` means the server sent no banner.
pub async fn probe_auth_banner(
    addr: &str,
    user: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    let captured = Arc::new(Mutex::new(None));
    let handler = BannerCapture {
        captured: captured.clone(),
    };
    let probe = async {
        let mut session =
            client::connect(Arc::new(client::Config::default()), addr, handler).await?;
        let _ = session.authenticate_none(user).await;
        let _ = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        Ok::<_, anyhow::Error>(())
    };
    let _ = tokio::time::timeout(timeout, probe).await;
    let banner = captured.lock().unwrap().take();
    Ok(banner)
}

struct BannerCapture {
    captured: Arc<Mutex<Option<String>>>,
}

impl client::Handler for BannerCapture {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // The probe only reads the banner; the host key is pinned elsewhere.
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        *self.captured.lock().unwrap() = Some(banner.to_string());
        Ok(())
    }
}

/// Transparent stream wrapper that records the first line the client
/// sends: its SSH identification string.
pub struct VersionTap<S> {
    inner: S,
    version: Arc<OnceLock<String>>,
    pending: Vec<u8>,
    capturing: bool,
}

impl<S> VersionTap<S> {
    /// Identification lines are at most 255 bytes per RFC 4253; anything
    /// longer is not a version line and capture gives up.
    const MAX_LINE: usize = 512;

    pub fn new(inner: S, version: Arc<OnceLock<String>>) -> Self {
        VersionTap {
            inner,
            version,
            pending: Vec::new(),
            capturing: true,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        if let Some(pos) = bytes.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&bytes[..pos]);
            let line = String::from_utf8_lossy(&self.pending)
                .trim_end_matches('\r')
                .to_string();
            let _ = self.version.set(line);
            self.pending = Vec::new();
            self.capturing = false;
        } else {
            self.pending.extend_from_slice(bytes);
            if self.pending.len() > Self::MAX_LINE {
                self.pending = Vec::new();
                self.capturing = false;
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VersionTap<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.capturing {
                    let fresh = buf.filled()[before..].to_vec();
                    this.observe(&fresh);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VersionTap<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_version_tap_captures_first_line() {
        let (mut near, far) = tokio::io::duplex(1024);
        let cell = Arc::new(OnceLock::new());
        let mut tap = VersionTap::new(far, cell.clone());

        near.write_all(b"SSH-2.0-OpenSSH_9.6\r\nbinary kex follows")
            .await
            .unwrap();
        near.flush().await.unwrap();

        let mut buf = vec![0u8; 64];
        let mut seen = Vec::new();
        while seen.len() < 39 {
            let n = tap.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
        }

        // Bytes pass through untouched and the version is captured.
        assert_eq!(&seen[..], b"SSH-2.0-OpenSSH_9.6\r\nbinary kex follows");
        assert_eq!(cell.get().map(String::as_str), Some("SSH-2.0-OpenSSH_9.6"));
    }

    #[tokio::test]
    async fn test_version_tap_split_reads() {
        let (mut near, far) = tokio::io::duplex(1024);
        let cell = Arc::new(OnceLock::new());
        let mut tap = VersionTap::new(far, cell.clone());

        near.write_all(b"SSH-2.0-pu").await.unwrap();
        near.flush().await.unwrap();
        let mut buf = vec![0u8; 16];
        let n = tap.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"SSH-2.0-pu");
        assert!(cell.get().is_none());

        near.write_all(b"tty_0.81\n").await.unwrap();
        near.flush().await.unwrap();
        tap.read(&mut buf).await.unwrap();
        assert_eq!(cell.get().map(String::as_str), Some("SSH-2.0-putty_0.81"));
    }

    #[tokio::test]
    async fn test_probe_server_version_skips_preamble() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"welcome to the machine\r\nSSH-2.0-OpenSSH_8.9\r\n")
                .await
                .unwrap();
        });

        let version = probe_server_version(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(version, "SSH-2.0-OpenSSH_8.9");
    }

    #[tokio::test]
    async fn test_probe_server_version_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = probe_server_version(&addr, Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
