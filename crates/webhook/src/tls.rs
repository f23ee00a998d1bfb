use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

pub const CERT_FILE: &str = "tls.crt";
pub const KEY_FILE: &str = "tls.key";

/// Build a TLS acceptor from `<dir>/tls.crt` and `<dir>/tls.key`.
///
/// Returns `None` when either file is absent; the caller then serves plain
/// HTTP. Files that exist but do not parse are an error.
pub fn load_acceptor(dir: &Path) -> Result<Option<TlsAcceptor>> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    if !cert_path.is_file() || !key_path.is_file() {
        warn!(dir = %dir.display(), "tls: certificate or key missing; serving plain HTTP");
        return Ok(None);
    }
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut reader = BufReader::new(File::open(&cert_path).with_context(|| format!("open {}", cert_path.display()))?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse {}", cert_path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificate in {}", cert_path.display()));
    }
    let mut reader = BufReader::new(File::open(&key_path).with_context(|| format!("open {}", key_path.display()))?);
    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parse {}", key_path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", key_path.display()))?;

    let mut cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("tls: certificate and key do not form a usable pair")?;
    cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    info!(cert = %cert_path.display(), "tls: loaded");
    Ok(Some(TlsAcceptor::from(Arc::new(cfg))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("vigil-tls-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_files_fall_back_to_plain() {
        assert!(load_acceptor(&scratch("empty")).unwrap().is_none());
    }

    #[test]
    fn unparsable_files_are_an_error() {
        let dir = scratch("garbage");
        std::fs::write(dir.join(CERT_FILE), "not a certificate").unwrap();
        std::fs::write(dir.join(KEY_FILE), "not a key").unwrap();
        assert!(load_acceptor(&dir).is_err());
    }
}
