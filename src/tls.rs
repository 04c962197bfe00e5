//! Self-signed identities, a dynamic trust store and TLS 1.2 configs.
//!
//! There is no CA: a certificate is trusted when its exact DER encoding is
//! in the [`TrustStore`]. Stores start empty and are filled by cert sharing,
//! by auto-trust, or from a JSON file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;
use rcgen::generate_simple_self_signed;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::error::TlsError;

/// Certificate and PKCS#8 private key, both DER.
#[derive(Clone)]
pub struct TlsIdentity {
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    pub fn generate(subject_alt_names: Vec<String>) -> Result<Self, TlsError> {
        let cert = generate_simple_self_signed(subject_alt_names)?;
        Ok(Self {
            cert: cert.cert.der().to_vec(),
            key: cert.signing_key.serialize_der(),
        })
    }

    pub fn from_der(cert: Vec<u8>, key: Vec<u8>) -> Result<Self, TlsError> {
        validate_certificate(&cert)?;
        PrivateKeyDer::try_from(key.clone()).map_err(|e| TlsError::InvalidKey(e.to_string()))?;
        Ok(Self { cert, key })
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        Self::from_der(fs::read(cert_path)?, fs::read(key_path)?)
    }

    /// Load the identity, generating and saving a new one if the files are missing.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path, name: &str) -> Result<Self, TlsError> {
        if cert_path.exists() && key_path.exists() {
            return Self::load(cert_path, key_path);
        }
        let identity = Self::generate(vec![name.to_string()])?;
        identity.save(cert_path, key_path)?;
        tracing::info!("Generated new identity at {}", cert_path.display());
        Ok(identity)
    }

    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        fs::write(cert_path, &self.cert)?;
        fs::write(key_path, &self.key)?;
        Ok(())
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert
    }

    fn certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert.clone())
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        PrivateKeyDer::try_from(self.key.clone()).map_err(|e| TlsError::InvalidKey(e.to_string()))
    }
}

/// Fail unless `der` is exactly one parseable X.509 certificate.
pub fn validate_certificate(der: &[u8]) -> Result<(), TlsError> {
    if der_length(der) != Some(der.len()) {
        return Err(TlsError::InvalidCertificate(format!(
            "expected a single DER certificate, got {} bytes",
            der.len()
        )));
    }
    rustls::RootCertStore::empty()
        .add(CertificateDer::from(der.to_vec()))
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))
}

/// Total length of the DER SEQUENCE starting at `buf[0]`, if its header is complete.
pub(crate) fn der_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 || buf[0] != 0x30 {
        return None;
    }
    let first = buf[1] as usize;
    if first < 0x80 {
        return Some(2 + first);
    }
    let count = first & 0x7F;
    if count == 0 || count > 4 || buf.len() < 2 + count {
        return None;
    }
    let len = buf[2..2 + count]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Some(2 + count + len)
}

#[derive(Default)]
struct TrustStoreInner {
    certs: RwLock<HashMap<String, Vec<u8>>>,
    auto_add: AtomicBool,
    path: RwLock<Option<PathBuf>>,
}

/// Alias to certificate map shared by every TLS config built from it.
///
/// When a path is attached every change is written back as JSON
/// (alias to base64 DER).
#[derive(Clone, Default)]
pub struct TrustStore {
    inner: Arc<TrustStoreInner>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("aliases", &self.aliases())
            .field("auto_add", &self.auto_add())
            .finish()
    }
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path` (empty if the file doesn't exist yet) and keep it
    /// attached for later saves.
    pub fn load(path: &Path) -> Result<Self, TlsError> {
        let store = Self::new();
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let encoded: HashMap<String, String> =
                serde_json::from_str(&content).map_err(|e| TlsError::Store {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            let mut certs = store.inner.certs.write();
            for (alias, value) in encoded {
                let der = BASE64.decode(value).map_err(|e| TlsError::Store {
                    path: path.to_path_buf(),
                    reason: format!("alias '{}': {}", alias, e),
                })?;
                certs.insert(alias, der);
            }
            tracing::info!("Loaded {} trusted certificates from {}", certs.len(), path.display());
        }
        *store.inner.path.write() = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn save(&self) -> Result<(), TlsError> {
        let Some(path) = self.inner.path.read().clone() else {
            return Ok(());
        };
        let encoded: HashMap<String, String> = self
            .inner
            .certs
            .read()
            .iter()
            .map(|(alias, der)| (alias.clone(), BASE64.encode(der)))
            .collect();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&encoded).map_err(|e| TlsError::Store {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json)?;
        tracing::debug!("Saved trust store to {}", path.display());
        Ok(())
    }

    pub fn set_auto_add(&self, enabled: bool) {
        self.inner.auto_add.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_add(&self) -> bool {
        self.inner.auto_add.load(Ordering::SeqCst)
    }

    /// Trust `der` under `alias`, replacing any certificate with that alias.
    pub fn add(&self, alias: &str, der: Vec<u8>) -> Result<(), TlsError> {
        validate_certificate(&der)?;
        self.inner.certs.write().insert(alias.to_string(), der);
        tracing::info!("Certificate '{}' added to trust store", alias);
        self.persist();
        Ok(())
    }

    pub fn remove(&self, alias: &str) -> bool {
        let removed = self.inner.certs.write().remove(alias).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn get(&self, alias: &str) -> Option<Vec<u8>> {
        self.inner.certs.read().get(alias).cloned()
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.inner.certs.read().contains_key(alias)
    }

    pub fn contains_cert(&self, der: &[u8]) -> bool {
        self.inner.certs.read().values().any(|c| c.as_slice() == der)
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.inner.certs.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.inner.certs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!("Failed to persist trust store: {}", e);
        }
    }

    /// Membership check used by both verifiers.
    fn check(&self, end_entity: &CertificateDer<'_>, auto_alias: impl FnOnce() -> String) -> Result<(), rustls::Error> {
        if self.contains_cert(end_entity.as_ref()) {
            return Ok(());
        }
        if self.auto_add() {
            let alias = auto_alias();
            return self
                .add(&alias, end_entity.as_ref().to_vec())
                .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding));
        }
        Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
    }
}

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

#[derive(Debug)]
struct TrustStoreServerVerifier {
    trust: TrustStore,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustStoreServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.trust
            .check(end_entity, || format!("SRV@{}", server_name.to_str()))?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug)]
struct TrustStoreClientVerifier {
    trust: TrustStore,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for TrustStoreClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.trust
            .check(end_entity, || format!("CL@auto-{}", uuid::Uuid::new_v4().simple()))?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS 1.2 server config. Client certificates are requested and required
/// only when `require_client_auth` is set.
pub fn server_config(
    identity: &TlsIdentity,
    trust: &TrustStore,
    require_client_auth: bool,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let provider = crypto_provider();
    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12])?;
    let builder = if require_client_auth {
        builder.with_client_cert_verifier(Arc::new(TrustStoreClientVerifier {
            trust: trust.clone(),
            provider,
        }))
    } else {
        builder.with_no_client_auth()
    };
    let config = builder.with_single_cert(vec![identity.certificate()], identity.private_key()?)?;
    Ok(Arc::new(config))
}

/// TLS 1.2 client config presenting `identity` when given.
pub fn client_config(
    identity: Option<&TlsIdentity>,
    trust: &TrustStore,
) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustStoreServerVerifier {
            trust: trust.clone(),
            provider,
        }));
    let config = match identity {
        Some(identity) => {
            builder.with_client_auth_cert(vec![identity.certificate()], identity.private_key()?)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_is_valid() {
        let identity = TlsIdentity::generate(vec!["obj-1".into()]).unwrap();
        assert!(validate_certificate(identity.cert_der()).is_ok());
        assert!(TlsIdentity::from_der(identity.cert_der().to_vec(), identity.key.clone()).is_ok());
    }

    #[test]
    fn partial_certificate_is_rejected() {
        let identity = TlsIdentity::generate(vec!["obj-1".into()]).unwrap();
        let der = identity.cert_der();
        assert_eq!(der_length(der), Some(der.len()));
        assert!(validate_certificate(&der[..der.len() / 2]).is_err());
        assert!(validate_certificate(b"not a cert").is_err());
    }

    #[test]
    fn trust_store_persists_as_base64_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();

        let store = TrustStore::load(&path).unwrap();
        assert!(store.is_empty());
        store.add("srv-1", identity.cert_der().to_vec()).unwrap();

        let json: HashMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["srv-1"], BASE64.encode(identity.cert_der()));

        let reloaded = TrustStore::load(&path).unwrap();
        assert!(reloaded.contains_cert(identity.cert_der()));
        assert_eq!(reloaded.aliases(), vec!["srv-1".to_string()]);
    }

    #[test]
    fn unknown_certificate_rejected_unless_auto_add() {
        let store = TrustStore::new();
        let identity = TlsIdentity::generate(vec!["cl".into()]).unwrap();
        let cert = identity.certificate();

        assert!(store.check(&cert, || "x".into()).is_err());
        store.set_auto_add(true);
        assert!(store.check(&cert, || "auto-cl".into()).is_ok());
        assert!(store.contains_alias("auto-cl"));
    }

    #[test]
    fn configs_build_for_tls12() {
        let identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();
        let trust = TrustStore::new();
        assert!(server_config(&identity, &trust, true).is_ok());
        assert!(server_config(&identity, &trust, false).is_ok());
        assert!(client_config(Some(&identity), &trust).is_ok());
        assert!(client_config(None, &trust).is_ok());
    }
}
