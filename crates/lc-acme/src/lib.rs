//! lecert ACME certificate issuance
//!
//! This crate obtains a single-domain certificate from an ACME certificate
//! authority, proving control of the domain with either an HTTP-01 responder
//! or a DNS-01 TXT record (published through Alibaba Cloud DNS or by hand).

pub mod account;
pub mod alidns;
pub mod client;
pub mod csr;
pub mod http01;
pub mod manager;
pub mod resolver;
pub mod storage;
pub mod types;

pub use account::{AccountKey, KeyAuthorization};
pub use alidns::{AliDns, DnsProvider, DnsRecordName};
pub use client::{AcmeClient, HttpAcmeClient, directory_url};
pub use csr::CertificateRequest;
pub use http01::Http01Responder;
pub use manager::{CertManager, IssuanceState, IssuedCertificate};
pub use resolver::{ChallengeResolver, DnsMode, OperatorPrompt, ResolverStrategy, ResolverTimings};
pub use storage::{CertStore, SavedPaths};
pub use types::{AcmeError, AcmeResult, CertificateMetadata};
