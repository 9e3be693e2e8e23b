//! Drives a single authorization to `valid` with HTTP-01 or DNS-01

use crate::alidns::{DnsProvider, DnsRecordName};
use crate::client::AcmeClient;
use crate::http01::Http01Responder;
use crate::types::{AcmeError, AcmeResult, AuthorizationStatus, Challenge, ChallengeType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Confirms that a manually published TXT record is in place
#[async_trait::async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Present the record to the operator and return once they confirm it
    async fn confirm(&self, record: &DnsRecordName, value: &str) -> AcmeResult<()>;
}

/// How the DNS-01 TXT record gets published
#[derive(Clone)]
pub enum DnsMode {
    /// Through a DNS provider API; the record is removed afterwards
    Provider(Arc<dyn DnsProvider>),
    /// By the operator, who confirms through the prompt
    Manual(Arc<dyn OperatorPrompt>),
}

#[derive(Clone)]
pub enum ResolverStrategy {
    Http01 { port: u16 },
    Dns01 { mode: DnsMode },
}

impl ResolverStrategy {
    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            Self::Http01 { .. } => ChallengeType::Http01,
            Self::Dns01 { .. } => ChallengeType::Dns01,
        }
    }
}

/// Delays and poll bounds for challenge validation
#[derive(Debug, Clone)]
pub struct ResolverTimings {
    /// Pause between starting the responder and accepting the challenge
    pub http_warmup: Duration,
    pub http_poll_interval: Duration,
    pub http_poll_attempts: u32,
    pub dns_poll_interval: Duration,
    pub dns_poll_attempts: u32,
    /// Wait after publishing the TXT record through the provider
    pub provider_propagation: Duration,
    /// Wait after the operator confirms a hand-made TXT record
    pub manual_propagation: Duration,
}

impl Default for ResolverTimings {
    fn default() -> Self {
        Self {
            http_warmup: Duration::from_secs(2),
            http_poll_interval: Duration::from_secs(2),
            http_poll_attempts: 30,
            dns_poll_interval: Duration::from_secs(5),
            dns_poll_attempts: 60,
            provider_propagation: Duration::from_secs(30),
            manual_propagation: Duration::from_secs(60),
        }
    }
}

pub struct ChallengeResolver {
    client: Arc<dyn AcmeClient>,
    strategy: ResolverStrategy,
    timings: ResolverTimings,
}

impl ChallengeResolver {
    pub fn new(client: Arc<dyn AcmeClient>, strategy: ResolverStrategy) -> Self {
        Self {
            client,
            strategy,
            timings: ResolverTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ResolverTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Bring the authorization at `authz_url` to `valid`
    pub async fn resolve(&self, authz_url: &str) -> AcmeResult<()> {
        let authz = self.client.get_authorization(authz_url).await?;
        let domain = authz.identifier.value.clone();

        if authz.status == AuthorizationStatus::Valid {
            info!(domain = %domain, "Authorization already valid");
            return Ok(());
        }
        if authz.status.is_failed() {
            return Err(AcmeError::Rejected(format!(
                "Authorization for {} is {:?}",
                domain, authz.status
            )));
        }

        let kind = self.strategy.challenge_type();
        let challenge = authz
            .find_challenge(kind)
            .cloned()
            .ok_or_else(|| AcmeError::ChallengeNotOffered {
                kind,
                domain: domain.clone(),
            })?;

        info!(domain = %domain, challenge = %kind, "Solving challenge");
        match &self.strategy {
            ResolverStrategy::Http01 { port } => {
                self.solve_http01(authz_url, &domain, &challenge, *port).await
            }
            ResolverStrategy::Dns01 { mode } => {
                self.solve_dns01(authz_url, &domain, &challenge, mode).await
            }
        }
    }

    async fn solve_http01(
        &self,
        authz_url: &str,
        domain: &str,
        challenge: &Challenge,
        port: u16,
    ) -> AcmeResult<()> {
        let key_auth = self.client.key_authorization(&challenge.token);
        let responder = Http01Responder::start(port, &challenge.token, key_auth.as_str()).await?;

        let result = async {
            tokio::time::sleep(self.timings.http_warmup).await;
            self.client.accept(challenge).await?;
            self.poll(
                authz_url,
                domain,
                self.timings.http_poll_interval,
                self.timings.http_poll_attempts,
            )
            .await
        }
        .await;

        responder.stop().await;
        result
    }

    async fn solve_dns01(
        &self,
        authz_url: &str,
        domain: &str,
        challenge: &Challenge,
        mode: &DnsMode,
    ) -> AcmeResult<()> {
        let record = DnsRecordName::from_domain(domain)?;
        let value = self.client.key_authorization(&challenge.token).dns_value();

        match mode {
            DnsMode::Provider(provider) => {
                provider.add_txt_record(domain, &value).await?;
                info!(
                    record = %record.fqdn(),
                    wait_secs = self.timings.provider_propagation.as_secs(),
                    "TXT record published, waiting for propagation"
                );

                let result = async {
                    tokio::time::sleep(self.timings.provider_propagation).await;
                    self.accept_and_poll_dns(authz_url, domain, challenge).await
                }
                .await;

                if let Err(e) = provider.delete_txt_records(domain).await {
                    warn!(record = %record.fqdn(), error = %e, "Failed to remove TXT record");
                } else {
                    debug!(record = %record.fqdn(), "TXT record removed");
                }
                result
            }
            DnsMode::Manual(prompt) => {
                prompt.confirm(&record, &value).await?;
                info!(
                    record = %record.fqdn(),
                    wait_secs = self.timings.manual_propagation.as_secs(),
                    "TXT record confirmed, waiting for propagation"
                );
                tokio::time::sleep(self.timings.manual_propagation).await;
                self.accept_and_poll_dns(authz_url, domain, challenge).await
            }
        }
    }

    async fn accept_and_poll_dns(
        &self,
        authz_url: &str,
        domain: &str,
        challenge: &Challenge,
    ) -> AcmeResult<()> {
        self.client.accept(challenge).await?;
        self.poll(
            authz_url,
            domain,
            self.timings.dns_poll_interval,
            self.timings.dns_poll_attempts,
        )
        .await
    }

    /// Observe the authorization up to `attempts` times, sleeping in between
    async fn poll(
        &self,
        authz_url: &str,
        domain: &str,
        interval: Duration,
        attempts: u32,
    ) -> AcmeResult<()> {
        for attempt in 1..=attempts {
            let authz = self.client.get_authorization(authz_url).await?;
            match authz.status {
                AuthorizationStatus::Valid => {
                    info!(domain = %domain, attempt, "Authorization valid");
                    return Ok(());
                }
                status if status.is_failed() => {
                    return Err(AcmeError::Rejected(format!(
                        "Authorization for {} is {:?}",
                        domain, status
                    )));
                }
                status => {
                    debug!(domain = %domain, attempt, status = ?status, "Authorization not valid yet");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(AcmeError::ValidationTimeout {
            domain: domain.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::KeyAuthorization;
    use crate::types::{Authorization, ChallengeStatus, Identifier, Order, Registration};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays authorization statuses; the last one repeats forever
    struct ScriptedClient {
        statuses: Vec<AuthorizationStatus>,
        challenges: Vec<Challenge>,
        fetches: AtomicUsize,
        accepts: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(statuses: Vec<AuthorizationStatus>) -> Self {
            Self {
                statuses,
                challenges: vec![
                    challenge(ChallengeType::Http01, "http-token"),
                    challenge(ChallengeType::Dns01, "dns-token"),
                ],
                fetches: AtomicUsize::new(0),
                accepts: AtomicUsize::new(0),
            }
        }

        fn only(mut self, kind: ChallengeType) -> Self {
            self.challenges.retain(|c| c.kind == kind);
            self
        }
    }

    fn challenge(kind: ChallengeType, token: &str) -> Challenge {
        Challenge {
            kind,
            url: format!("https://ca/chall/{}", token),
            token: token.to_string(),
            status: ChallengeStatus::Pending,
        }
    }

    #[async_trait::async_trait]
    impl AcmeClient for ScriptedClient {
        async fn register(&self, _email: &str) -> AcmeResult<Registration> {
            Ok(Registration::Existing)
        }

        async fn create_order(&self, _domain: &str) -> AcmeResult<Order> {
            Err(AcmeError::Config("not used".into()))
        }

        async fn get_authorization(&self, _url: &str) -> AcmeResult<Authorization> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            let status = self.statuses[n.min(self.statuses.len() - 1)];
            Ok(Authorization {
                identifier: Identifier::dns("api.example.com"),
                status,
                challenges: self.challenges.clone(),
            })
        }

        async fn accept(&self, _challenge: &Challenge) -> AcmeResult<()> {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn finalize(&self, _order: &Order, _csr_der: &[u8]) -> AcmeResult<Vec<Vec<u8>>> {
            Err(AcmeError::Config("not used".into()))
        }

        fn key_authorization(&self, token: &str) -> KeyAuthorization {
            KeyAuthorization::new(format!("{}.thumb", token))
        }
    }

    struct Confirmed(Mutex<Vec<(String, String)>>);

    #[async_trait::async_trait]
    impl OperatorPrompt for Confirmed {
        async fn confirm(&self, record: &DnsRecordName, value: &str) -> AcmeResult<()> {
            self.0
                .lock()
                .unwrap()
                .push((record.fqdn(), value.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<String>>,
        fail_delete: bool,
    }

    #[async_trait::async_trait]
    impl DnsProvider for RecordingProvider {
        async fn add_txt_record(&self, domain: &str, value: &str) -> AcmeResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("add {} {}", domain, value));
            Ok(())
        }

        async fn delete_txt_records(&self, domain: &str) -> AcmeResult<()> {
            self.calls.lock().unwrap().push(format!("delete {}", domain));
            if self.fail_delete {
                return Err(AcmeError::DnsProvider("[Forbidden] denied".into()));
            }
            Ok(())
        }
    }

    fn fast() -> ResolverTimings {
        ResolverTimings {
            http_warmup: Duration::ZERO,
            http_poll_interval: Duration::from_millis(1),
            http_poll_attempts: 30,
            dns_poll_interval: Duration::from_millis(1),
            dns_poll_attempts: 60,
            provider_propagation: Duration::ZERO,
            manual_propagation: Duration::ZERO,
        }
    }

    fn manual() -> (Arc<Confirmed>, ResolverStrategy) {
        let prompt = Arc::new(Confirmed(Mutex::new(Vec::new())));
        let strategy = ResolverStrategy::Dns01 {
            mode: DnsMode::Manual(prompt.clone()),
        };
        (prompt, strategy)
    }

    #[test]
    fn test_default_timings() {
        let t = ResolverTimings::default();
        assert_eq!(t.http_warmup, Duration::from_secs(2));
        assert_eq!(t.http_poll_interval, Duration::from_secs(2));
        assert_eq!(t.http_poll_attempts, 30);
        assert_eq!(t.dns_poll_interval, Duration::from_secs(5));
        assert_eq!(t.dns_poll_attempts, 60);
        assert_eq!(t.provider_propagation, Duration::from_secs(30));
        assert_eq!(t.manual_propagation, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_already_valid_short_circuits() {
        let client = Arc::new(ScriptedClient::new(vec![AuthorizationStatus::Valid]));
        let (prompt, strategy) = manual();
        let resolver = ChallengeResolver::new(client.clone(), strategy).with_timings(fast());

        resolver.resolve("https://ca/authz/1").await.unwrap();
        assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(client.accepts.load(Ordering::SeqCst), 0);
        assert!(prompt.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_failed_is_rejected() {
        let client = Arc::new(ScriptedClient::new(vec![AuthorizationStatus::Expired]));
        let (_, strategy) = manual();
        let resolver = ChallengeResolver::new(client.clone(), strategy).with_timings(fast());

        assert!(matches!(
            resolver.resolve("https://ca/authz/1").await,
            Err(AcmeError::Rejected(_))
        ));
        assert_eq!(client.accepts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pending_forever_times_out_after_exact_polls() {
        let client = Arc::new(ScriptedClient::new(vec![AuthorizationStatus::Pending]));
        let (_, strategy) = manual();
        let mut timings = fast();
        timings.dns_poll_attempts = 4;
        let resolver = ChallengeResolver::new(client.clone(), strategy).with_timings(timings);

        let err = resolver.resolve("https://ca/authz/1").await.unwrap_err();
        match err {
            AcmeError::ValidationTimeout { domain, attempts } => {
                assert_eq!(domain, "api.example.com");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        // initial observation plus one fetch per poll
        assert_eq!(client.fetches.load(Ordering::SeqCst), 5);
        assert_eq!(client.accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_after_pending_is_rejected_not_timeout() {
        let client = Arc::new(ScriptedClient::new(vec![
            AuthorizationStatus::Pending,
            AuthorizationStatus::Pending,
            AuthorizationStatus::Invalid,
        ]));
        let (_, strategy) = manual();
        let resolver = ChallengeResolver::new(client.clone(), strategy).with_timings(fast());

        assert!(matches!(
            resolver.resolve("https://ca/authz/1").await,
            Err(AcmeError::Rejected(_))
        ));
        assert_eq!(client.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_manual_prompt_gets_record_and_digest() {
        let client = Arc::new(ScriptedClient::new(vec![
            AuthorizationStatus::Pending,
            AuthorizationStatus::Valid,
        ]));
        let (prompt, strategy) = manual();
        let resolver = ChallengeResolver::new(client.clone(), strategy).with_timings(fast());

        resolver.resolve("https://ca/authz/1").await.unwrap();
        let confirmed = prompt.0.lock().unwrap().clone();
        assert_eq!(
            confirmed,
            vec![(
                "_acme-challenge.api.example.com".to_string(),
                KeyAuthorization::new("dns-token.thumb").dns_value()
            )]
        );
    }

    #[tokio::test]
    async fn test_provider_record_removed_after_rejection() {
        let client = Arc::new(ScriptedClient::new(vec![
            AuthorizationStatus::Pending,
            AuthorizationStatus::Invalid,
        ]));
        let provider = Arc::new(RecordingProvider::default());
        let strategy = ResolverStrategy::Dns01 {
            mode: DnsMode::Provider(provider.clone()),
        };
        let resolver = ChallengeResolver::new(client, strategy).with_timings(fast());

        assert!(resolver.resolve("https://ca/authz/1").await.is_err());
        let calls = provider.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("add api.example.com "));
        assert_eq!(calls[1], "delete api.example.com");
    }

    #[tokio::test]
    async fn test_provider_delete_failure_does_not_fail() {
        let client = Arc::new(ScriptedClient::new(vec![
            AuthorizationStatus::Pending,
            AuthorizationStatus::Valid,
        ]));
        let provider = Arc::new(RecordingProvider {
            fail_delete: true,
            ..Default::default()
        });
        let strategy = ResolverStrategy::Dns01 {
            mode: DnsMode::Provider(provider.clone()),
        };
        let resolver = ChallengeResolver::new(client, strategy).with_timings(fast());

        resolver.resolve("https://ca/authz/1").await.unwrap();
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_challenge_type() {
        let client = Arc::new(
            ScriptedClient::new(vec![AuthorizationStatus::Pending]).only(ChallengeType::Http01),
        );
        let (_, strategy) = manual();
        let resolver = ChallengeResolver::new(client.clone(), strategy).with_timings(fast());

        assert!(matches!(
            resolver.resolve("https://ca/authz/1").await,
            Err(AcmeError::ChallengeNotOffered {
                kind: ChallengeType::Dns01,
                ..
            })
        ));
        assert_eq!(client.accepts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http01_responder_released_after_timeout() {
        let spare = Http01Responder::start(0, "spare", "spare").await.unwrap();
        let port = spare.local_addr().port();
        spare.stop().await;

        let client = Arc::new(ScriptedClient::new(vec![AuthorizationStatus::Pending]));
        let mut timings = fast();
        timings.http_poll_attempts = 2;
        let resolver = ChallengeResolver::new(client.clone(), ResolverStrategy::Http01 { port })
            .with_timings(timings);

        assert!(matches!(
            resolver.resolve("https://ca/authz/1").await,
            Err(AcmeError::ValidationTimeout { attempts: 2, .. })
        ));
        let again = Http01Responder::start(port, "spare", "spare").await.unwrap();
        again.stop().await;
    }
}
