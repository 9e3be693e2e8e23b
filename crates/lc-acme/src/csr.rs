//! Certificate signing request for a single domain

use crate::types::{AcmeError, AcmeResult};
use p256::SecretKey;
use p256::pkcs8::{DecodePrivateKey, LineEnding};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// Fresh P-256 certificate key and the DER CSR signed with it
pub struct CertificateRequest {
    csr_der: Vec<u8>,
    key_pem: String,
}

impl CertificateRequest {
    /// Generate a new key and a CSR with `domain` as CN and only SAN
    pub fn generate(domain: &str) -> AcmeResult<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| AcmeError::Key(format!("Failed to generate certificate key: {}", e)))?;

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| AcmeError::Csr(format!("Invalid subject name {}: {}", domain, e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::Csr(format!("Failed to build CSR: {}", e)))?;

        // rcgen hands out PKCS#8; the key file is written as SEC1 `EC PRIVATE KEY`
        let secret = SecretKey::from_pkcs8_der(&key_pair.serialize_der())
            .map_err(|e| AcmeError::Key(format!("Failed to decode certificate key: {}", e)))?;
        let key_pem = secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| AcmeError::Key(format!("Failed to encode certificate key: {}", e)))?
            .to_string();

        Ok(Self {
            csr_der: csr.der().to_vec(),
            key_pem,
        })
    }

    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    /// Private key as a SEC1 PEM block
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}
