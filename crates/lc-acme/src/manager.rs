use crate::client::AcmeClient;
use crate::csr::CertificateRequest;
use crate::resolver::ChallengeResolver;
use crate::storage::{CertStore, SavedPaths};
use crate::types::{AcmeError, AcmeResult, CertificateMetadata, OrderStatus, Registration};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Progress of one issuance; failure is reported with the last state reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Init,
    AccountRegistered,
    OrderCreated,
    ResolvingAuth(usize),
    AllAuthValid,
    CsrReady,
    Finalized,
    Persisted,
}

impl std::fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::AccountRegistered => f.write_str("account-registered"),
            Self::OrderCreated => f.write_str("order-created"),
            Self::ResolvingAuth(i) => write!(f, "resolving-auth[{}]", i),
            Self::AllAuthValid => f.write_str("all-auth-valid"),
            Self::CsrReady => f.write_str("csr-ready"),
            Self::Finalized => f.write_str("finalized"),
            Self::Persisted => f.write_str("persisted"),
        }
    }
}

/// Result of a successful issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub domain: String,
    pub paths: SavedPaths,
    /// `None` when the saved certificate could not be parsed back
    pub metadata: Option<CertificateMetadata>,
}

/// Runs register → order → authorize → finalize → persist for one domain
pub struct CertManager {
    client: Arc<dyn AcmeClient>,
    resolver: ChallengeResolver,
    store: CertStore,
    email: String,
}

impl CertManager {
    pub fn new(
        client: Arc<dyn AcmeClient>,
        resolver: ChallengeResolver,
        store: CertStore,
        email: &str,
    ) -> Self {
        Self {
            client,
            resolver,
            store,
            email: email.to_string(),
        }
    }

    /// Obtain and persist a certificate for `domain`. No step is retried.
    pub async fn obtain_certificate(&self, domain: &str) -> AcmeResult<IssuedCertificate> {
        let mut state = IssuanceState::Init;
        match self.issue(domain, &mut state).await {
            Ok(issued) => Ok(issued),
            Err(e) => {
                error!(domain = %domain, state = %state, error = %e, "Certificate issuance failed");
                Err(e)
            }
        }
    }

    async fn issue(
        &self,
        domain: &str,
        state: &mut IssuanceState,
    ) -> AcmeResult<IssuedCertificate> {
        info!(domain = %domain, "Requesting certificate");

        match self.client.register(&self.email).await? {
            Registration::Created => info!(email = %self.email, "Registered new ACME account"),
            Registration::Existing => info!(email = %self.email, "Using existing ACME account"),
        }
        transition(state, IssuanceState::AccountRegistered, domain);

        let order = self.client.create_order(domain).await?;
        transition(state, IssuanceState::OrderCreated, domain);

        if order.authorizations.is_empty() && order.status != OrderStatus::Ready {
            return Err(AcmeError::Rejected(format!(
                "Order for {} has no authorizations",
                domain
            )));
        }

        for (i, authz_url) in order.authorizations.iter().enumerate() {
            transition(state, IssuanceState::ResolvingAuth(i), domain);
            self.resolver.resolve(authz_url).await?;
        }
        transition(state, IssuanceState::AllAuthValid, domain);

        let request = CertificateRequest::generate(domain)?;
        transition(state, IssuanceState::CsrReady, domain);

        let chain = self.client.finalize(&order, request.csr_der()).await?;
        transition(state, IssuanceState::Finalized, domain);

        let paths = self.store.save(domain, &chain, request.key_pem())?;
        transition(state, IssuanceState::Persisted, domain);

        let metadata = match self.store.describe(&paths.cert) {
            Ok(meta) => {
                info!(
                    subject = %meta.subject,
                    issuer = %meta.issuer,
                    dns_names = ?meta.dns_names,
                    not_before = %meta.not_before,
                    not_after = %meta.not_after,
                    days_remaining = meta.days_until_expiry(),
                    serial = %meta.serial,
                    "Certificate issued"
                );
                Some(meta)
            }
            Err(e) => {
                warn!(cert = %paths.cert.display(), error = %e, "Failed to read back issued certificate");
                None
            }
        };

        Ok(IssuedCertificate {
            domain: domain.to_string(),
            paths,
            metadata,
        })
    }
}

fn transition(state: &mut IssuanceState, next: IssuanceState, domain: &str) {
    debug!(domain = %domain, from = %state, to = %next, "Issuance state change");
    *state = next;
}
