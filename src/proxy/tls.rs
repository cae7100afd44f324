use crate::config::AppConfig;
use rustls::{pki_types::CertificateDer, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Builds the acceptor for the HTTPS listener. `None` (logged) when no
/// certificate is configured or it cannot be loaded; the HTTPS listener is
/// then skipped.
pub fn load_tls_acceptor(config: &AppConfig) -> Option<TlsAcceptor> {
    let cert_path = config.ssl_certificate.as_deref()?;
    let key_path = config.ssl_certificate_key.as_deref()?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "loading TLS certificate"
    );

    let certs: Vec<CertificateDer> = certs(&mut open(cert_path)?)
        .filter_map(|c| c.ok())
        .collect();
    if certs.is_empty() {
        error!(path = %cert_path.display(), "no certificates found");
        return None;
    }

    let key = match private_key(&mut open(key_path)?) {
        Ok(Some(k)) => k,
        _ => {
            error!(path = %key_path.display(), "failed to parse private key");
            return None;
        }
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut server_config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .and_then(|b| b.with_no_client_auth().with_single_cert(certs, key))
        .map_err(|e| error!(error = %e, "failed to build TLS config"))
        .ok()?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Some(TlsAcceptor::from(Arc::new(server_config)))
}

fn open(path: &Path) -> Option<BufReader<File>> {
    File::open(path)
        .map_err(|e| error!(path = %path.display(), error = %e, "cannot open"))
        .ok()
        .map(BufReader::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_material_disables_tls() {
        let mut cfg = AppConfig::default();
        assert!(load_tls_acceptor(&cfg).is_none());

        cfg.ssl_certificate = Some("/nonexistent/cert.pem".into());
        cfg.ssl_certificate_key = Some("/nonexistent/key.pem".into());
        assert!(load_tls_acceptor(&cfg).is_none());
    }
}
