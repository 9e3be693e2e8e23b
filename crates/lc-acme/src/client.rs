//! ACME v2 protocol client (RFC 8555)
//!
//! [`AcmeClient`] is the capability the issuance core depends on.
//! [`HttpAcmeClient`] implements it against a real ACME server: directory
//! discovery, replay nonces, ES256 JWS envelopes and POST-as-GET reads.

use crate::account::{AccountKey, KeyAuthorization};
use crate::types::{
    AcmeError, AcmeResult, Authorization, Challenge, Identifier, Order, OrderStatus, Registration,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Let's Encrypt ACME v2 production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt ACME v2 staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Directory URL for the selected environment
pub fn directory_url(staging: bool) -> &'static str {
    if staging {
        LETS_ENCRYPT_STAGING
    } else {
        LETS_ENCRYPT_PRODUCTION
    }
}

/// ACME operations the issuance core needs
#[async_trait::async_trait]
pub trait AcmeClient: Send + Sync {
    /// Register the account key. An already-registered key is not an error.
    async fn register(&self, email: &str) -> AcmeResult<Registration>;

    /// Create an order for a single DNS identifier
    async fn create_order(&self, domain: &str) -> AcmeResult<Order>;

    /// Fetch the current state of an authorization
    async fn get_authorization(&self, url: &str) -> AcmeResult<Authorization>;

    /// Tell the server the challenge is ready for validation
    async fn accept(&self, challenge: &Challenge) -> AcmeResult<()>;

    /// Submit the CSR and return the issued chain as DER, leaf first
    async fn finalize(&self, order: &Order, csr_der: &[u8]) -> AcmeResult<Vec<Vec<u8>>>;

    /// Key authorization for a challenge token
    fn key_authorization(&self, token: &str) -> KeyAuthorization;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

/// RFC 7807 problem document
#[derive(Debug, Deserialize)]
struct Problem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    detail: String,
}

/// Order polling after finalization
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ORDER_POLL_ATTEMPTS: u32 = 30;

/// [`AcmeClient`] speaking RFC 8555 over HTTPS
pub struct HttpAcmeClient {
    http: reqwest::Client,
    directory_url: String,
    key: Arc<AccountKey>,
    directory: Mutex<Option<Directory>>,
    account_url: Mutex<Option<String>>,
    nonce: Mutex<Option<String>>,
    order_poll_interval: Duration,
}

impl HttpAcmeClient {
    pub fn new(directory_url: &str, key: Arc<AccountKey>) -> AcmeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("lecert/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AcmeError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            directory_url: directory_url.to_string(),
            key,
            directory: Mutex::new(None),
            account_url: Mutex::new(None),
            nonce: Mutex::new(None),
            order_poll_interval: ORDER_POLL_INTERVAL,
        })
    }

    /// Override the post-finalize order polling interval
    pub fn with_order_poll_interval(mut self, interval: Duration) -> Self {
        self.order_poll_interval = interval;
        self
    }

    async fn directory(&self) -> AcmeResult<Directory> {
        let mut cached = self.directory.lock().await;
        if let Some(dir) = cached.as_ref() {
            return Ok(dir.clone());
        }

        let resp = self
            .http
            .get(&self.directory_url)
            .send()
            .await
            .map_err(|e| AcmeError::Transport(format!("ACME directory fetch failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(AcmeError::Protocol {
                status: resp.status().as_u16(),
                detail: "ACME directory unavailable".to_string(),
            });
        }

        let dir: Directory = resp
            .json()
            .await
            .map_err(|e| AcmeError::Transport(format!("ACME directory parse failed: {}", e)))?;

        debug!(new_account = %dir.new_account, new_order = %dir.new_order, "ACME directory fetched");
        *cached = Some(dir.clone());
        Ok(dir)
    }

    /// Use the last `Replay-Nonce`, or fetch a fresh one
    async fn nonce(&self) -> AcmeResult<String> {
        if let Some(nonce) = self.nonce.lock().await.take() {
            return Ok(nonce);
        }

        let dir = self.directory().await?;
        let resp = self
            .http
            .head(&dir.new_nonce)
            .send()
            .await
            .map_err(|e| AcmeError::Transport(format!("ACME nonce request failed: {}", e)))?;

        header(&resp, "replay-nonce")
            .ok_or_else(|| AcmeError::Transport("No replay-nonce header in response".to_string()))
    }

    /// Flattened JWS. newAccount requests always embed the `jwk`; everything
    /// else uses `kid` once the account URL is known.
    async fn jws(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
        embed_jwk: bool,
    ) -> AcmeResult<String> {
        let nonce = self.nonce().await?;
        let kid = if embed_jwk {
            None
        } else {
            self.account_url.lock().await.clone()
        };
        let header = match kid {
            Some(kid) => serde_json::json!({
                "alg": "ES256",
                "kid": kid,
                "nonce": nonce,
                "url": url,
            }),
            None => serde_json::json!({
                "alg": "ES256",
                "jwk": self.key.jwk(),
                "nonce": nonce,
                "url": url,
            }),
        };

        let protected = URL_SAFE_NO_PAD.encode(header.to_string());
        // POST-as-GET carries an empty payload
        let payload = payload
            .map(|p| URL_SAFE_NO_PAD.encode(p.to_string()))
            .unwrap_or_default();
        let signature = self.key.sign(format!("{}.{}", protected, payload).as_bytes());

        Ok(serde_json::json!({
            "protected": protected,
            "payload": payload,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        })
        .to_string())
    }

    /// Signed POST, keeping the returned nonce; any status is passed through
    async fn send(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
        embed_jwk: bool,
    ) -> AcmeResult<reqwest::Response> {
        let body = self.jws(url, payload, embed_jwk).await?;

        let resp = self
            .http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(body)
            .send()
            .await
            .map_err(|e| AcmeError::Transport(format!("ACME POST to {} failed: {}", url, e)))?;

        if let Some(nonce) = header(&resp, "replay-nonce") {
            *self.nonce.lock().await = Some(nonce);
        }
        Ok(resp)
    }

    /// Signed POST; problem documents become [`AcmeError::Protocol`]
    async fn post(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> AcmeResult<reqwest::Response> {
        let resp = self.send(url, payload, false).await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(problem(resp).await)
    }

    async fn get_order(&self, url: &str) -> AcmeResult<Order> {
        let resp = self.post(url, None).await?;
        let mut order: Order = resp
            .json()
            .await
            .map_err(|e| AcmeError::Transport(format!("Failed to parse ACME order: {}", e)))?;
        order.url = url.to_string();
        Ok(order)
    }

    /// Account URL for an already-registered key
    async fn lookup_account(&self, dir: &Directory) -> AcmeResult<String> {
        let payload = serde_json::json!({ "onlyReturnExisting": true });
        let resp = self.send(&dir.new_account, Some(&payload), true).await?;
        if !resp.status().is_success() {
            return Err(problem(resp).await);
        }
        header(&resp, "location")
            .ok_or_else(|| AcmeError::Transport("No Location header in account response".into()))
    }

    async fn download_chain(&self, url: &str) -> AcmeResult<Vec<Vec<u8>>> {
        let resp = self.post(url, None).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| AcmeError::Transport(format!("Failed to read certificate body: {}", e)))?;

        let chain: Vec<Vec<u8>> = pem::parse_many(&text)
            .map_err(|e| AcmeError::Certificate(format!("Invalid PEM chain: {}", e)))?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.into_contents())
            .collect();

        if chain.is_empty() {
            return Err(AcmeError::Certificate(
                "Certificate response contained no certificates".to_string(),
            ));
        }

        info!(certificates = chain.len(), "Certificate chain downloaded");
        Ok(chain)
    }
}

fn header(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn problem(resp: reqwest::Response) -> AcmeError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<Problem>(&text) {
        Ok(problem) => format!("{} ({})", problem.detail, problem.kind),
        Err(_) => text,
    };
    AcmeError::Protocol { status, detail }
}

#[async_trait::async_trait]
impl AcmeClient for HttpAcmeClient {
    async fn register(&self, email: &str) -> AcmeResult<Registration> {
        let dir = self.directory().await?;
        let payload = serde_json::json!({
            "termsOfServiceAgreed": true,
            "contact": [format!("mailto:{}", email)],
        });

        let resp = self.send(&dir.new_account, Some(&payload), true).await?;
        let registration = match resp.status() {
            StatusCode::CREATED => Registration::Created,
            // 409 Conflict: the key is already bound to an account
            StatusCode::OK | StatusCode::CONFLICT => Registration::Existing,
            _ => return Err(problem(resp).await),
        };

        let known = self.account_url.lock().await.clone();
        let account_url = match header(&resp, "location").or(known) {
            Some(url) => url,
            None => self.lookup_account(&dir).await?,
        };

        info!(account_url = %account_url, registration = ?registration, "ACME account ready");
        *self.account_url.lock().await = Some(account_url);
        Ok(registration)
    }

    async fn create_order(&self, domain: &str) -> AcmeResult<Order> {
        let dir = self.directory().await?;
        let payload = serde_json::json!({
            "identifiers": [Identifier::dns(domain)],
        });

        let resp = self.post(&dir.new_order, Some(&payload)).await?;
        let url = header(&resp, "location").unwrap_or_default();
        let mut order: Order = resp
            .json()
            .await
            .map_err(|e| AcmeError::Transport(format!("Failed to parse ACME order: {}", e)))?;
        order.url = url;

        info!(
            domain = %domain,
            status = ?order.status,
            authorizations = order.authorizations.len(),
            "ACME order created"
        );
        Ok(order)
    }

    async fn get_authorization(&self, url: &str) -> AcmeResult<Authorization> {
        let resp = self.post(url, None).await?;
        resp.json()
            .await
            .map_err(|e| AcmeError::Transport(format!("Failed to parse authorization: {}", e)))
    }

    async fn accept(&self, challenge: &Challenge) -> AcmeResult<()> {
        self.post(&challenge.url, Some(&serde_json::json!({}))).await?;
        debug!(url = %challenge.url, kind = %challenge.kind, "Challenge accepted");
        Ok(())
    }

    async fn finalize(&self, order: &Order, csr_der: &[u8]) -> AcmeResult<Vec<Vec<u8>>> {
        let payload = serde_json::json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let resp = self.post(&order.finalize, Some(&payload)).await?;
        let mut current: Order = resp
            .json()
            .await
            .map_err(|e| AcmeError::Transport(format!("Failed to parse finalize response: {}", e)))?;
        current.url = order.url.clone();

        let mut attempts = 0;
        loop {
            match current.status {
                OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(AcmeError::Rejected(format!(
                        "Order {} became invalid during finalization",
                        order.url
                    )));
                }
                status => {
                    attempts += 1;
                    if attempts > ORDER_POLL_ATTEMPTS {
                        return Err(AcmeError::ValidationTimeout {
                            domain: order
                                .identifiers
                                .first()
                                .map(|i| i.value.clone())
                                .unwrap_or_default(),
                            attempts: ORDER_POLL_ATTEMPTS,
                        });
                    }
                    debug!(status = ?status, attempt = attempts, "Order not valid yet");
                    tokio::time::sleep(self.order_poll_interval).await;
                    current = self.get_order(&order.url).await?;
                }
            }
        }

        let cert_url = current.certificate.ok_or_else(|| {
            AcmeError::Certificate("Order completed but no certificate URL".to_string())
        })?;
        self.download_chain(&cert_url).await
    }

    fn key_authorization(&self, token: &str) -> KeyAuthorization {
        self.key.key_authorization(token)
    }
}
