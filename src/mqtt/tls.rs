//! TLS material for the broker listeners and the upstream proxy connections

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, ServerConfig, SignatureScheme,
};
use rumqttc::tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::error::MqttError;

/// Builds a server acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, MqttError> {
    let mut cert_reader = BufReader::new(File::open(cert_path).map_err(|e| {
        MqttError::Tls(format!("cannot open certificate {}: {}", cert_path.display(), e))
    })?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MqttError::Tls(format!("invalid certificate {}: {}", cert_path.display(), e)))?;
    if certs.is_empty() {
        return Err(MqttError::Tls(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path).map_err(|e| {
        MqttError::Tls(format!("cannot open key {}: {}", key_path.display(), e))
    })?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| MqttError::Tls(format!("invalid key {}: {}", key_path.display(), e)))?
        .ok_or_else(|| MqttError::Tls(format!("no private key found in {}", key_path.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| MqttError::Tls(e.to_string()))?;

    debug!("Loaded TLS certificate {}", cert_path.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client configuration that accepts any server certificate.
///
/// The vendor endpoint is dialed by resolved IP, so hostname checks can never
/// succeed.
pub fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_certificate_is_a_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert!(matches!(err, MqttError::Tls(_)));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let mut file = File::create(&cert).unwrap();
        writeln!(file, "# nothing here").unwrap();

        let err = load_acceptor(&cert, &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("no certificate"));
    }
}
