use pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsConfig;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long a graceful close waits for the peer to finish the handshake before the
/// watchdog forces the connection closed with 1006. Matches the source's 15 second timer.
pub const CLOSE_WATCHDOG: Duration = Duration::from_secs(15);

/// Scratch buffer size shared by a worker's connections for a single read/inflate pass.
pub const LARGE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub web_socket_config: WebSocketConfig,
    pub tls_config: Option<Arc<RustlsConfig>>,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Caps a single frame's payload; frames declaring a larger length are a protocol
    /// error (close 1006) rather than a truncation, since the header is trusted before
    /// any payload bytes are read.
    pub max_frame_size: Option<usize>,
    /// Caps the reassembled message across all fragments. Overflow is truncated and the
    /// message is still delivered unless `close_on_oversize_message` is set (see §7/§9 of
    /// the design doc).
    pub max_payload: Option<usize>,
    /// When `true`, a message that would overflow `max_payload` closes the connection
    /// with 1009 instead of silently truncating. Defaults to `false` to stay bit-compatible
    /// with the observed source behavior.
    pub close_on_oversize_message: bool,
    /// Offered to clients during the handshake; actual use is still gated by the client's
    /// own `Sec-WebSocket-Extensions` offer (see `extensions` and `handshake`).
    pub permessage_deflate: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_payload: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            close_on_oversize_message: false,
            permessage_deflate: true,
        }
    }
}

/// Builds a rustls server config from a PEM certificate chain and private key on disk,
/// for callers that want `ServerConfig::tls_config` without wiring up rustls themselves.
pub fn load_tls_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> io::Result<Arc<RustlsConfig>> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in file"))?;

    let config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(Arc::new(config))
}
