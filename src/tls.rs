//! TLS client configuration: system roots, extra CA PEM, optional verification bypass.

use crate::config::TlsConfig;
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::certs;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, warn};

/// Build the client config for ldaps:// and StartTLS from the `tls` config section.
pub fn client_config(tls: Option<&TlsConfig>) -> Result<Arc<ClientConfig>> {
    let default = TlsConfig::default();
    let tls = tls.unwrap_or(&default);
    if tls.skip_verify {
        warn!("TLS server certificate verification is disabled");
        return Ok(insecure_client_config());
    }
    let mut root_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs().context("Load system CA certs")?;
    let (added, ignored) = root_store.add_parsable_certificates(native);
    debug!("Loaded {} system CA certificates ({} ignored)", added, ignored);
    if let Some(ref ca_file) = tls.ca_file {
        for cert in load_certs_from_file(ca_file)? {
            root_store
                .add(cert)
                .with_context(|| format!("Add CA certificate from {}", ca_file))?;
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Resolve the name to verify and send as SNI.
pub fn server_name(tls: Option<&TlsConfig>, host: &str) -> Result<ServerName<'static>> {
    let name = tls
        .and_then(|t| t.server_name.clone())
        .unwrap_or_else(|| host.to_string());
    ServerName::try_from(name.clone())
        .map_err(|_| anyhow::anyhow!("Invalid hostname for TLS SNI: {}", name))
}

pub fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open CA file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn insecure_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Arc::new(config)
}

/// Verifier that accepts any server certificate. Only for `skip_verify`.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
