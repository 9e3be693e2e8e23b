mod config;
mod prompt;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches};
use config::{ChallengeConfig, Cli, IssueConfig};
use lc_acme::{
    AccountKey, AliDns, CertManager, CertStore, ChallengeResolver, DnsMode, HttpAcmeClient,
    ResolverStrategy, directory_url,
};
use prompt::StdinPrompt;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    // Environment must be complete before clap reads env fallbacks
    let env_file = config::env_file_arg(std::env::args_os());
    let env_result = match &env_file {
        Some(path) => config::load_dotenv(path).map(Some),
        None => Ok(config::load_dotenv(Path::new(".env")).ok()),
    };

    let matches = Cli::command().version(config::version()).get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    init_tracing(cli.log_json);

    match env_result {
        Ok(Some(count)) => info!(vars = count, "Loaded environment file"),
        Ok(None) => {}
        Err(e) => {
            let path = cli.env_file.as_deref().unwrap_or(Path::new(".env"));
            error!(path = %path.display(), error = %e, "Failed to read environment file");
            return ExitCode::from(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(&cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,lecert=debug,lc_acme=debug"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = IssueConfig::from_cli(cli)?;

    let environment = if config.staging { "staging" } else { "production" };
    info!(
        domain = %config.domain,
        environment,
        challenge = challenge_name(&config.challenge),
        cert_dir = %config.cert_dir.display(),
        "lecert {} starting",
        config::version()
    );
    if config.staging {
        warn!("Using the staging environment; the certificate will not be trusted by browsers");
    }

    let store = CertStore::new(&config.cert_dir);
    store
        .init()
        .with_context(|| format!("Failed to create {}", config.cert_dir.display()))?;

    let key = AccountKey::load_or_create(&store.account_key_path())
        .context("Failed to load ACME account key")?;
    let client = Arc::new(
        HttpAcmeClient::new(directory_url(config.staging), Arc::new(key))
            .context("Failed to create ACME client")?,
    );

    let strategy = match &config.challenge {
        ChallengeConfig::Http01 { port } => ResolverStrategy::Http01 { port: *port },
        ChallengeConfig::Dns01AliDns {
            access_key_id,
            access_key_secret,
        } => ResolverStrategy::Dns01 {
            mode: DnsMode::Provider(Arc::new(AliDns::new(access_key_id, access_key_secret)?)),
        },
        ChallengeConfig::Dns01Manual => ResolverStrategy::Dns01 {
            mode: DnsMode::Manual(Arc::new(StdinPrompt)),
        },
    };

    let resolver = ChallengeResolver::new(client.clone(), strategy);
    let manager = CertManager::new(client, resolver, store, &config.email);

    let issued = manager
        .obtain_certificate(&config.domain)
        .await
        .with_context(|| format!("Failed to obtain certificate for {}", config.domain))?;

    println!();
    println!("Certificate: {}", issued.paths.cert.display());
    println!("Private key: {}", issued.paths.key.display());
    if let Some(meta) = &issued.metadata {
        println!("Subject:     {}", meta.subject);
        println!("DNS names:   {}", meta.dns_names.join(", "));
        println!("Issuer:      {}", meta.issuer);
        println!("Valid from:  {}", meta.not_before.format("%Y-%m-%d %H:%M:%S UTC"));
        println!(
            "Valid until: {} ({} days)",
            meta.not_after.format("%Y-%m-%d %H:%M:%S UTC"),
            meta.days_until_expiry()
        );
        println!("Serial:      {}", meta.serial);
    }

    Ok(())
}

fn challenge_name(challenge: &ChallengeConfig) -> &'static str {
    match challenge {
        ChallengeConfig::Http01 { .. } => "http-01",
        ChallengeConfig::Dns01AliDns { .. } => "dns-01 (alidns)",
        ChallengeConfig::Dns01Manual => "dns-01 (manual)",
    }
}
