//! TLS configuration for the stream layer.
//!
//! Builds rustls configs from PEM files. Server-side configs optionally
//! require client certificates (mTLS for cluster traffic); peer-side configs
//! trust the cluster CA and optionally present a client certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::config::TlsSettings;
use crate::error::{ClusterError, ClusterResult};

/// Builds the server-side TLS config. A CA file makes client certificates
/// mandatory and verified against it.
pub fn server_config(settings: &TlsSettings) -> ClusterResult<Arc<ServerConfig>> {
    let certs = load_certs(&settings.cert_file)?;
    let key = load_private_key(&settings.key_file)?;

    let builder = ServerConfig::builder();
    let config = match &settings.ca_file {
        Some(ca_file) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca_file)?))
                .build()
                .map_err(|e| ClusterError::Config(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| ClusterError::Config(format!("server tls: {e}")))?;

    Ok(Arc::new(config))
}

/// Builds the peer-side TLS config used when dialing other cluster members.
pub fn client_config(settings: &TlsSettings) -> ClusterResult<Arc<ClientConfig>> {
    let ca_file = settings
        .ca_file
        .as_ref()
        .ok_or_else(|| ClusterError::Config("peer tls requires a ca_file".to_string()))?;
    let builder = ClientConfig::builder().with_root_certificates(root_store(ca_file)?);

    let config = if settings.cert_file.as_os_str().is_empty() {
        builder.with_no_client_auth()
    } else {
        let certs = load_certs(&settings.cert_file)?;
        let key = load_private_key(&settings.key_file)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClusterError::Config(format!("peer tls: {e}")))?
    };

    Ok(Arc::new(config))
}

fn root_store(ca_file: &Path) -> ClusterResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots
            .add(cert)
            .map_err(|e| ClusterError::Config(format!("ca cert: {e}")))?;
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> ClusterResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Config(format!("certs in {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> ClusterResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClusterError::Config(format!("key in {}: {e}", path.display())))?
        .ok_or_else(|| ClusterError::Config(format!("no private key in {}", path.display())))
}
