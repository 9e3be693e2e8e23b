//! Alibaba Cloud DNS record management for ACME DNS-01 challenges

use crate::types::{AcmeError, AcmeResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const ALIDNS_ENDPOINT: &str = "https://alidns.aliyuncs.com/";
const ALIDNS_API_VERSION: &str = "2015-01-09";
const CHALLENGE_LABEL: &str = "_acme-challenge";

/// Publishes and removes DNS-01 TXT records
#[async_trait::async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create `_acme-challenge[.<sub>]` TXT under the domain's apex
    async fn add_txt_record(&self, domain: &str, value: &str) -> AcmeResult<()>;

    /// Remove every TXT record at the domain's challenge name
    async fn delete_txt_records(&self, domain: &str) -> AcmeResult<()>;
}

/// Zone apex and relative record name for a challenge domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecordName {
    /// Last two labels, e.g. `example.com`
    pub apex: String,
    /// Record name relative to the apex, e.g. `_acme-challenge.api`
    pub rr: String,
}

impl DnsRecordName {
    pub fn from_domain(domain: &str) -> AcmeResult<Self> {
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
            return Err(AcmeError::InvalidDomain(domain.to_string()));
        }

        let split = labels.len() - 2;
        let apex = labels[split..].join(".");
        let rr = if split == 0 {
            CHALLENGE_LABEL.to_string()
        } else {
            format!("{}.{}", CHALLENGE_LABEL, labels[..split].join("."))
        };

        Ok(Self { apex, rr })
    }

    /// Fully qualified record name
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.rr, self.apex)
    }
}

/// Per-request signature inputs
#[derive(Debug, Clone)]
pub struct RequestStamp {
    pub nonce: String,
    pub timestamp: DateTime<Utc>,
}

impl RequestStamp {
    pub fn now() -> Self {
        let timestamp = Utc::now();
        Self {
            nonce: timestamp.timestamp_millis().to_string(),
            timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AliDnsResponse {
    request_id: String,
    #[serde(default)]
    record_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AliDnsError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// RFC 3986 percent-encoding as required by the AliDNS signature scheme:
/// space → `%20`, `*` → `%2A`, `~` kept
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Sorted, encoded `k=v&k=v` query
fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// `GET&%2F&<encoded canonical query>`
pub fn string_to_sign(params: &BTreeMap<String, String>) -> String {
    format!("GET&%2F&{}", percent_encode(&canonical_query(params)))
}

/// HMAC-SHA1 over the string-to-sign, keyed with `secret&`, base64 encoded
pub fn sign(params: &BTreeMap<String, String>, access_key_secret: &str) -> String {
    let key = ring::hmac::Key::new(
        ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        format!("{}&", access_key_secret).as_bytes(),
    );
    let tag = ring::hmac::sign(&key, string_to_sign(params).as_bytes());
    STANDARD.encode(tag.as_ref())
}

/// Alibaba Cloud DNS client
pub struct AliDns {
    http: reqwest::Client,
    access_key_id: String,
    access_key_secret: String,
    endpoint: String,
}

impl AliDns {
    pub fn new(access_key_id: &str, access_key_secret: &str) -> AcmeResult<Self> {
        if access_key_id.is_empty() || access_key_secret.is_empty() {
            return Err(AcmeError::Config(
                "AliDNS access key id and secret are required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AcmeError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            access_key_id: access_key_id.to_string(),
            access_key_secret: access_key_secret.to_string(),
            endpoint: ALIDNS_ENDPOINT.to_string(),
        })
    }

    /// Point the client at another endpoint (used by tests)
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// Full parameter set for an operation, including `Signature`
    pub fn signed_params(
        &self,
        operation: &[(&str, &str)],
        stamp: &RequestStamp,
    ) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = [
            ("Format", "JSON".to_string()),
            ("Version", ALIDNS_API_VERSION.to_string()),
            ("SignatureMethod", "HMAC-SHA1".to_string()),
            ("SignatureNonce", stamp.nonce.clone()),
            ("SignatureVersion", "1.0".to_string()),
            ("AccessKeyId", self.access_key_id.clone()),
            (
                "Timestamp",
                stamp.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        for (k, v) in operation {
            params.insert(k.to_string(), v.to_string());
        }

        let signature = sign(&params, &self.access_key_secret);
        params.insert("Signature".to_string(), signature);
        params
    }

    async fn request(&self, operation: &[(&str, &str)]) -> AcmeResult<AliDnsResponse> {
        let params = self.signed_params(operation, &RequestStamp::now());
        let url = format!("{}?{}", self.endpoint, canonical_query(&params));

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AcmeError::DnsProvider(format!("HTTP request failed: {}", e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AcmeError::DnsProvider(format!("Failed to read response: {}", e)))?;

        debug!(status = %status, body = %body, "AliDNS response");

        if !status.is_success() {
            let detail = serde_json::from_str::<AliDnsError>(&body)
                .map(|e| format!("[{}] {}", e.code, e.message))
                .unwrap_or(body);
            return Err(AcmeError::DnsProvider(format!(
                "AliDNS API error (HTTP {}): {}",
                status, detail
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| AcmeError::DnsProvider(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait::async_trait]
impl DnsProvider for AliDns {
    async fn add_txt_record(&self, domain: &str, value: &str) -> AcmeResult<()> {
        let name = DnsRecordName::from_domain(domain)?;

        info!(apex = %name.apex, rr = %name.rr, "Creating ACME challenge TXT record in AliDNS");

        let resp = self
            .request(&[
                ("Action", "AddDomainRecord"),
                ("DomainName", name.apex.as_str()),
                ("RR", name.rr.as_str()),
                ("Type", "TXT"),
                ("Value", value),
            ])
            .await?;

        info!(
            rr = %name.rr,
            record_id = resp.record_id.as_deref().unwrap_or("-"),
            request_id = %resp.request_id,
            "Created ACME challenge TXT record"
        );
        Ok(())
    }

    async fn delete_txt_records(&self, domain: &str) -> AcmeResult<()> {
        let name = DnsRecordName::from_domain(domain)?;

        debug!(apex = %name.apex, rr = %name.rr, "Deleting ACME challenge TXT records");

        let resp = self
            .request(&[
                ("Action", "DeleteSubDomainRecords"),
                ("DomainName", name.apex.as_str()),
                ("RR", name.rr.as_str()),
                ("Type", "TXT"),
            ])
            .await?;

        info!(rr = %name.rr, request_id = %resp.request_id, "Deleted ACME challenge TXT records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixed_stamp() -> RequestStamp {
        RequestStamp {
            nonce: "1700000000000".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2023-11-14T22:13:20Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    fn client() -> AliDns {
        AliDns::new("testid", "testsecret").unwrap()
    }

    #[test]
    fn test_record_name_apex() {
        let name = DnsRecordName::from_domain("example.com").unwrap();
        assert_eq!(name.apex, "example.com");
        assert_eq!(name.rr, "_acme-challenge");
        assert_eq!(name.fqdn(), "_acme-challenge.example.com");
    }

    #[test]
    fn test_record_name_subdomain() {
        let name = DnsRecordName::from_domain("api.example.com").unwrap();
        assert_eq!(name.apex, "example.com");
        assert_eq!(name.rr, "_acme-challenge.api");

        let name = DnsRecordName::from_domain("a.b.example.com").unwrap();
        assert_eq!(name.apex, "example.com");
        assert_eq!(name.rr, "_acme-challenge.a.b");
    }

    #[test]
    fn test_record_name_rejects_single_label() {
        assert!(matches!(
            DnsRecordName::from_domain("bad"),
            Err(AcmeError::InvalidDomain(_))
        ));
        assert!(DnsRecordName::from_domain("").is_err());
        assert!(DnsRecordName::from_domain("example..com").is_err());
    }

    #[test]
    fn test_percent_encode_table() {
        assert_eq!(percent_encode(" "), "%20");
        assert_eq!(percent_encode("*"), "%2A");
        assert_eq!(percent_encode("~"), "~");
        assert_eq!(percent_encode("+"), "%2B");
        assert_eq!(percent_encode("a-b_c.d"), "a-b_c.d");
        assert_eq!(percent_encode("a=b&c"), "a%3Db%26c");
        assert_eq!(percent_encode("2023-11-14T22:13:20Z"), "2023-11-14T22%3A13%3A20Z");
    }

    #[test]
    fn test_percent_encode_decodes_back() {
        for input in ["+", "*", "~", " ", "a+b*c~d e/f=g&h", "_acme-challenge.api", "中文"] {
            let encoded = percent_encode(input);
            assert!(!encoded.contains(['+', '*', ' ']), "{:?} -> {:?}", input, encoded);
            assert_eq!(urlencoding::decode(&encoded).unwrap(), input);
        }
    }

    #[test]
    fn test_string_to_sign_layout() {
        let mut params = BTreeMap::new();
        params.insert("b".to_string(), "x y".to_string());
        params.insert("a".to_string(), "1*".to_string());
        // Sorted "a=1%2A&b=x%20y", then encoded once more
        assert_eq!(string_to_sign(&params), "GET&%2F&a%3D1%252A%26b%3Dx%2520y");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let dns = client();
        let op = [("Action", "AddDomainRecord"), ("Value", "abc")];
        let first = dns.signed_params(&op, &fixed_stamp());
        let second = dns.signed_params(&op, &fixed_stamp());
        assert_eq!(first["Signature"], second["Signature"]);
        // Base64 of a 20-byte SHA-1 digest
        assert_eq!(first["Signature"].len(), 28);
    }

    #[test]
    fn test_signature_depends_on_inputs() {
        let dns = client();
        let op = [("Action", "AddDomainRecord"), ("Value", "abc")];
        let base = dns.signed_params(&op, &fixed_stamp());

        let other_value = dns.signed_params(&[("Action", "AddDomainRecord"), ("Value", "abd")], &fixed_stamp());
        assert_ne!(base["Signature"], other_value["Signature"]);

        let mut stamp = fixed_stamp();
        stamp.nonce = "1700000000001".to_string();
        let other_nonce = dns.signed_params(&op, &stamp);
        assert_ne!(base["Signature"], other_nonce["Signature"]);

        let other_secret = AliDns::new("testid", "othersecret")
            .unwrap()
            .signed_params(&op, &fixed_stamp());
        assert_ne!(base["Signature"], other_secret["Signature"]);
    }

    #[test]
    fn test_signed_params_common_set() {
        let params = client().signed_params(&[("Action", "DeleteSubDomainRecords")], &fixed_stamp());
        assert_eq!(params["Format"], "JSON");
        assert_eq!(params["Version"], "2015-01-09");
        assert_eq!(params["SignatureMethod"], "HMAC-SHA1");
        assert_eq!(params["SignatureVersion"], "1.0");
        assert_eq!(params["SignatureNonce"], "1700000000000");
        assert_eq!(params["AccessKeyId"], "testid");
        assert_eq!(params["Timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(params["Action"], "DeleteSubDomainRecords");
    }

    #[test]
    fn test_signature_matches_manual_hmac() {
        let params = client().signed_params(&[("Action", "AddDomainRecord")], &fixed_stamp());
        let mut unsigned = params.clone();
        unsigned.remove("Signature");

        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, b"testsecret&");
        let expected = ring::hmac::sign(&key, string_to_sign(&unsigned).as_bytes());
        assert_eq!(params["Signature"], STANDARD.encode(expected.as_ref()));
    }

    #[test]
    fn test_new_requires_credentials() {
        assert!(matches!(AliDns::new("", "secret"), Err(AcmeError::Config(_))));
        assert!(matches!(AliDns::new("id", ""), Err(AcmeError::Config(_))));
    }

    #[tokio::test]
    async fn test_add_txt_record_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("Action", "AddDomainRecord"))
            .and(query_param("DomainName", "example.com"))
            .and(query_param("RR", "_acme-challenge.api"))
            .and(query_param("Type", "TXT"))
            .and(query_param("Value", "txt-value"))
            .and(query_param("SignatureMethod", "HMAC-SHA1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "RequestId": "req-1",
                "RecordId": "rec-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dns = client().with_endpoint(&format!("{}/", server.uri()));
        dns.add_txt_record("api.example.com", "txt-value").await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "RequestId": "req-2",
                "Code": "InvalidAccessKeyId.NotFound",
                "Message": "Specified access key is not found."
            })))
            .mount(&server)
            .await;

        let dns = client().with_endpoint(&format!("{}/", server.uri()));
        let err = dns.delete_txt_records("example.com").await.unwrap_err();
        assert!(err.to_string().contains("InvalidAccessKeyId.NotFound"));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let dns = client().with_endpoint(&format!("{}/", server.uri()));
        assert!(matches!(
            dns.add_txt_record("example.com", "v").await,
            Err(AcmeError::DnsProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_domain_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dns = client().with_endpoint(&format!("{}/", server.uri()));
        assert!(matches!(
            dns.add_txt_record("bad", "v").await,
            Err(AcmeError::InvalidDomain(_))
        ));
    }
}
