use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ACME identifier (always `dns` here)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(domain: &str) -> Self {
        Self {
            kind: "dns".to_string(),
            value: domain.to_string(),
        }
    }
}

/// Order status as reported by the ACME server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// ACME order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Order URL from the `Location` header (not part of the JSON body)
    #[serde(skip)]
    pub url: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
}

/// Authorization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
    Revoked,
    Deactivated,
}

impl AuthorizationStatus {
    /// Terminal failure: the authorization can never become valid
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Invalid | Self::Expired | Self::Revoked | Self::Deactivated
        )
    }
}

/// Proof-of-control record for one identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// First offered challenge of the given type
    pub fn find_challenge(&self, kind: ChallengeType) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

/// Challenge type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// One proof mechanism offered for an authorization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: ChallengeStatus,
}

/// Outcome of account registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new account was created
    Created,
    /// The key was already registered (HTTP 200 or 409)
    Existing,
}

/// Parsed metadata of an issued certificate, for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMetadata {
    pub subject: String,
    pub issuer: String,
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: String,
}

impl CertificateMetadata {
    /// Check if certificate is expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.not_after
    }

    /// Get days until expiration
    pub fn days_until_expiry(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Challenge type {kind} not offered for {domain}")]
    ChallengeNotOffered { kind: ChallengeType, domain: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("ACME server returned HTTP {status}: {detail}")]
    Protocol { status: u16, detail: String },

    #[error("Validation rejected: {0}")]
    Rejected(String),

    #[error("Validation timed out for {domain} after {attempts} attempts")]
    ValidationTimeout { domain: String, attempts: u32 },

    #[error("DNS provider error: {0}")]
    DnsProvider(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("CSR error: {0}")]
    Csr(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AcmeError {
    /// HTTP status of a protocol-level rejection, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type AcmeResult<T> = Result<T, AcmeError>;
