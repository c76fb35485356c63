use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, DnsName, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use std::sync::{Arc, OnceLock};

use crate::config::TlsTrust;

/// Install the ring crypto provider once, process-wide. A provider already
/// installed by the embedding application wins.
pub(crate) fn ensure_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
    });
}

/// Client-side TLS helper: builds rustls configs per the configured trust
/// mode and resolves SNI names.
pub struct TlsHelper {
    trust: TlsTrust,
}

impl TlsHelper {
    pub fn new(trust: TlsTrust) -> Self {
        ensure_crypto_provider();
        Self { trust }
    }

    /// Cheap sanity check run before every connection attempt.
    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.trust {
            TlsTrust::CaFile(path) => {
                if !path.is_file() {
                    anyhow::bail!("validate: CA bundle {} not found", path.display());
                }
                Ok(())
            }
            TlsTrust::Insecure => Ok(()),
            TlsTrust::InsecurePinned(fp) => {
                if !fp.starts_with("sha256:") {
                    anyhow::bail!("validate: pinned fingerprint must be sha256:..-formatted");
                }
                Ok(())
            }
        }
    }

    /// Build a client config advertising the given ALPN protocols. Pinned
    /// trust installs a verifier that rejects the handshake on fingerprint
    /// mismatch, so a bad pin never produces a usable channel.
    pub fn client_config(&self, alpn: &[&[u8]]) -> anyhow::Result<Arc<ClientConfig>> {
        let mut config = match &self.trust {
            TlsTrust::CaFile(path) => {
                let pem = std::fs::read(path)?;
                let mut roots = RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut &pem[..]) {
                    roots.add(cert?)?;
                }
                if roots.is_empty() {
                    anyhow::bail!("client_config: no certificates in {}", path.display());
                }
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            TlsTrust::Insecure => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(OriginCertVerifier::new(None)))
                .with_no_client_auth(),
            TlsTrust::InsecurePinned(pin) => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(OriginCertVerifier::new(Some(
                    pin.clone(),
                ))))
                .with_no_client_auth(),
        };
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }

    /// Resolve the SNI name for a peer host. IP literals carry no SNI unless
    /// `force_sni` is set, in which case the literal is sent as a DNS name.
    pub fn server_name(
        &self,
        peer_host: &str,
        force_sni: bool,
    ) -> anyhow::Result<ServerName<'static>> {
        if force_sni {
            if let Ok(name) = DnsName::try_from(peer_host.to_string()) {
                return Ok(ServerName::DnsName(name));
            }
        }
        ServerName::try_from(peer_host.to_string())
            .map_err(|e| anyhow::anyhow!("server_name: invalid peer host {}: {}", peer_host, e))
    }
}

/// Certificate fingerprint in `sha256:AA:BB:...` form.
pub fn format_cert_fingerprint(cert_der: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    use std::fmt::Write;

    let digest = Sha256::digest(cert_der);
    let mut out = String::with_capacity(7 + digest.len() * 3);
    out.push_str("sha256");
    for byte in digest {
        let _ = write!(out, ":{:02X}", byte);
    }
    out
}

/// Verifier for origins the configuration chose not to chain-verify: skips
/// the web-PKI path but still checks handshake signatures, and optionally
/// gates the handshake on a pinned leaf-certificate fingerprint.
#[derive(Debug)]
pub(crate) struct OriginCertVerifier {
    pin: Option<String>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl OriginCertVerifier {
    fn new(pin: Option<String>) -> Self {
        Self {
            pin,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for OriginCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(pin) = &self.pin {
            let actual = format_cert_fingerprint(end_entity.as_ref());
            if &actual != pin {
                return Err(rustls::Error::General(format!(
                    "peer certificate {} does not match pinned {}",
                    actual, pin
                )));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_formatting() {
        let fp = format_cert_fingerprint(b"test");
        assert!(fp.starts_with("sha256:"));
        // 32 bytes, colon-separated
        assert_eq!(fp.trim_start_matches("sha256:").split(':').count(), 32);
    }

    #[test]
    fn validate_rejects_malformed_pin() {
        let helper = TlsHelper::new(TlsTrust::InsecurePinned("md5:00".into()));
        assert!(helper.validate().is_err());
        let helper = TlsHelper::new(TlsTrust::InsecurePinned("sha256:00".into()));
        assert!(helper.validate().is_ok());
    }

    #[test]
    fn sni_for_ip_hosts_requires_force() {
        let helper = TlsHelper::new(TlsTrust::Insecure);
        let name = helper.server_name("127.0.0.1", false).unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
        let name = helper.server_name("example.com", false).unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn alpn_protocols_are_advertised() {
        let helper = TlsHelper::new(TlsTrust::Insecure);
        let config = helper.client_config(&[b"h2", b"http/1.1"]).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn pinned_verifier_gates_the_handshake() {
        ensure_crypto_provider();
        let cert = CertificateDer::from(b"not-a-real-cert".to_vec());
        let pin = format_cert_fingerprint(cert.as_ref());
        let verifier = OriginCertVerifier::new(Some(pin));
        let name = ServerName::try_from("example.com").unwrap();

        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());

        let other = CertificateDer::from(b"something-else".to_vec());
        assert!(verifier
            .verify_server_cert(&other, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn unpinned_verifier_accepts_any_certificate() {
        ensure_crypto_provider();
        let verifier = OriginCertVerifier::new(None);
        let cert = CertificateDer::from(b"self-signed".to_vec());
        let name = ServerName::try_from("example.com").unwrap();
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());
    }
}
