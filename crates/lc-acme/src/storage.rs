use crate::account::write_private;
use crate::types::{AcmeError, AcmeResult, CertificateMetadata};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

/// Files written for one issued certificate
#[derive(Debug, Clone)]
pub struct SavedPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Certificate directory layout: `account.key`, `<domain>.crt`, `<domain>.key`
pub struct CertStore {
    base_path: PathBuf,
}

impl CertStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create the certificate directory
    pub fn init(&self) -> AcmeResult<()> {
        fs::create_dir_all(&self.base_path)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path to the ACME account key
    pub fn account_key_path(&self) -> PathBuf {
        self.base_path.join("account.key")
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.base_path.join(format!("{}.crt", domain))
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.base_path.join(format!("{}.key", domain))
    }

    /// Write the chain (leaf first) and its private key, replacing earlier files
    pub fn save(&self, domain: &str, chain: &[Vec<u8>], key_pem: &str) -> AcmeResult<SavedPaths> {
        if chain.is_empty() {
            return Err(AcmeError::Certificate(format!(
                "Empty certificate chain for {}",
                domain
            )));
        }

        let cert_pem: String = chain
            .iter()
            .map(|der| {
                pem::encode_config(
                    &pem::Pem::new("CERTIFICATE", der.clone()),
                    pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
                )
            })
            .collect();

        let cert_path = self.cert_path(domain);
        let temp_path = cert_path.with_extension("crt.tmp");
        fs::write(&temp_path, &cert_pem)?;
        fs::rename(&temp_path, &cert_path)?;

        let key_path = self.key_path(domain);
        write_private(&key_path, key_pem)?;

        info!(
            domain = %domain,
            cert = %cert_path.display(),
            key = %key_path.display(),
            certificates = chain.len(),
            "Certificate saved"
        );

        Ok(SavedPaths {
            cert: cert_path,
            key: key_path,
        })
    }

    /// Parse the leaf (first PEM block) of a certificate file
    pub fn describe(&self, cert_path: &Path) -> AcmeResult<CertificateMetadata> {
        let content = fs::read(cert_path)?;
        let (_, pem) = parse_x509_pem(&content)
            .map_err(|e| AcmeError::Certificate(format!("Failed to parse PEM: {}", e)))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| AcmeError::Certificate(format!("Failed to parse certificate: {}", e)))?;

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(CertificateMetadata {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            dns_names,
            not_before: timestamp(cert.validity().not_before.timestamp())?,
            not_after: timestamp(cert.validity().not_after.timestamp())?,
            serial: cert.raw_serial_as_string(),
        })
    }
}

fn timestamp(secs: i64) -> AcmeResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AcmeError::Certificate(format!("Validity out of range: {}", secs)))
}
