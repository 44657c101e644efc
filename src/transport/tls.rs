//! TLS client layer for the upstream tunnel

use std::sync::Arc;

use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::common::{Result, Stream};
use crate::error::Error;

/// TLS configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for SNI; falls back to the relay host
    pub server_name: Option<String>,
    /// Skip certificate verification
    pub allow_insecure: bool,
}

/// TLS wrapper for encrypting tunnel streams
pub struct TlsWrapper {
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl TlsWrapper {
    /// Build a connector. `default_name` is used when no SNI is configured.
    pub fn new(config: &TlsConfig, default_name: &str) -> Result<Self> {
        let name = config.server_name.as_deref().unwrap_or(default_name);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|_| Error::Config(format!("Invalid TLS server name: {}", name)))?;

        Ok(Self {
            server_name,
            connector: Self::build_connector(config),
        })
    }

    fn build_connector(config: &TlsConfig) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if config.allow_insecure {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        TlsConnector::from(Arc::new(tls_config))
    }

    /// Perform the client handshake over `stream`
    pub async fn wrap(&self, stream: Stream) -> Result<Stream> {
        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| Error::Tunnel(format!("TLS handshake failed: {}", e)))?;
        Ok(Box::new(tls_stream))
    }
}

/// Certificate verifier that accepts anything; for self-signed relays
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_fallback() {
        let wrapper = TlsWrapper::new(&TlsConfig::default(), "relay.example.com").unwrap();
        assert_eq!(
            wrapper.server_name,
            ServerName::try_from("relay.example.com".to_string()).unwrap()
        );
    }

    #[test]
    fn test_invalid_server_name() {
        let config = TlsConfig {
            server_name: Some("bad name!".into()),
            allow_insecure: true,
        };
        assert!(matches!(TlsWrapper::new(&config, "x"), Err(Error::Config(_))));
    }
}
