//! ACME account key: load, generate, persist, sign

use crate::types::{AcmeError, AcmeResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::SecretKey;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::LineEnding;
use rand_core::OsRng;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// ECDSA P-256 key authenticating every ACME request
pub struct AccountKey {
    secret: SecretKey,
    signing: SigningKey,
}

impl AccountKey {
    /// Generate a new P-256 key from the OS CSPRNG
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let signing = SigningKey::from(&secret);
        Self { secret, signing }
    }

    /// Decode a SEC1 `EC PRIVATE KEY` PEM block
    pub fn from_pem(pem: &str) -> AcmeResult<Self> {
        let secret = SecretKey::from_sec1_pem(pem)
            .map_err(|e| AcmeError::Key(format!("Failed to parse account key: {}", e)))?;
        Ok(Self::from_secret(secret))
    }

    /// Encode as a SEC1 `EC PRIVATE KEY` PEM block
    pub fn to_pem(&self) -> AcmeResult<String> {
        let pem = self
            .secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| AcmeError::Key(format!("Failed to encode account key: {}", e)))?;
        Ok(pem.to_string())
    }

    /// Load the key at `path`, or generate and persist a new one.
    ///
    /// Any read or decode failure falls back to generation; only a failure
    /// to write the new key is fatal.
    pub fn load_or_create(path: &Path) -> AcmeResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(pem) => match Self::from_pem(&pem) {
                Ok(key) => {
                    info!(path = %path.display(), "Loaded existing ACME account key");
                    return Ok(key);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unusable account key, generating a new one");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read account key, generating a new one");
            }
        }

        let key = Self::generate();
        write_private(path, &key.to_pem()?)?;
        info!(path = %path.display(), "Generated new ACME account key");
        Ok(key)
    }

    /// Uncompressed public point coordinates, base64url encoded
    fn coordinates(&self) -> (String, String) {
        let point = self.secret.public_key().to_encoded_point(false);
        // Uncompressed points always carry both coordinates
        let x = point.x().map(|x| URL_SAFE_NO_PAD.encode(x)).unwrap_or_default();
        let y = point.y().map(|y| URL_SAFE_NO_PAD.encode(y)).unwrap_or_default();
        (x, y)
    }

    /// JWK public key for the JWS protected header
    pub fn jwk(&self) -> serde_json::Value {
        let (x, y) = self.coordinates();
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": x,
            "y": y,
        })
    }

    /// RFC 7638 JWK thumbprint
    pub fn thumbprint(&self) -> String {
        let (x, y) = self.coordinates();
        // Required members in lexicographic order, no whitespace
        let jwk = format!(r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#, x, y);
        let digest = ring::digest::digest(&ring::digest::SHA256, jwk.as_bytes());
        URL_SAFE_NO_PAD.encode(digest.as_ref())
    }

    /// ES256 signature (fixed-size `r || s`)
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing.sign(data);
        signature.to_bytes().to_vec()
    }

    /// Bind a challenge token to this key
    pub fn key_authorization(&self, token: &str) -> KeyAuthorization {
        KeyAuthorization(format!("{}.{}", token, self.thumbprint()))
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

/// `token.thumbprint`, served for HTTP-01 and hashed for DNS-01
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAuthorization(String);

impl KeyAuthorization {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// DNS-01 TXT value: base64url(SHA-256(key authorization))
    pub fn dns_value(&self) -> String {
        let digest = ring::digest::digest(&ring::digest::SHA256, self.0.as_bytes());
        URL_SAFE_NO_PAD.encode(digest.as_ref())
    }
}

/// Write a private key file, readable by the owner only on Unix.
///
/// New files are created with mode 0600; an existing file is narrowed to
/// 0600 before any key material is written to it.
pub(crate) fn write_private(path: &Path, content: &str) -> AcmeResult<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content.as_bytes())?;
    Ok(())
}
