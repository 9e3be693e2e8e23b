use clap::Parser;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Obtain a Let's Encrypt certificate for a single domain
#[derive(Parser, Debug)]
#[command(name = "lecert")]
pub struct Cli {
    /// Domain to issue the certificate for
    #[arg(short = 'd', long, env = "LECERT_DOMAIN")]
    pub domain: String,

    /// Contact email for the ACME account
    #[arg(short = 'm', long, env = "LECERT_EMAIL")]
    pub email: String,

    /// Directory holding the account key and issued certificates
    #[arg(short = 'c', long, default_value = "./certs")]
    pub cert_dir: PathBuf,

    /// Use the Let's Encrypt staging environment
    #[arg(short = 's', long)]
    pub staging: bool,

    /// Port for the HTTP-01 responder
    #[arg(short = 'p', long, default_value_t = 80)]
    pub port: u16,

    /// Use the DNS-01 challenge
    #[arg(long)]
    pub dns: bool,

    /// Publish the DNS-01 TXT record by hand
    #[arg(long)]
    pub manual_dns: bool,

    /// Alibaba Cloud DNS AccessKey ID
    #[arg(long, env = "ALIDNS_ACCESS_KEY_ID", hide_env_values = true)]
    pub alidns_key: Option<String>,

    /// Alibaba Cloud DNS AccessKey secret
    #[arg(long, env = "ALIDNS_ACCESS_KEY_SECRET", hide_env_values = true)]
    pub alidns_secret: Option<String>,

    /// KEY=VALUE file loaded before reading the environment (default ./.env)
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

/// `--version` text, with build metadata when it was provided at compile time
pub fn version() -> String {
    let mut version = env!("CARGO_PKG_VERSION").to_string();
    if let Some(commit) = option_env!("LECERT_GIT_COMMIT") {
        version.push_str(&format!(" ({}", commit));
        if let Some(date) = option_env!("LECERT_BUILD_DATE") {
            version.push_str(&format!(" {}", date));
        }
        version.push(')');
    }
    version
}

/// How the domain is proven
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeConfig {
    Http01 { port: u16 },
    Dns01AliDns { access_key_id: String, access_key_secret: String },
    Dns01Manual,
}

/// Validated issuance settings
#[derive(Debug, Clone)]
pub struct IssueConfig {
    pub domain: String,
    pub email: String,
    pub cert_dir: PathBuf,
    pub staging: bool,
    pub challenge: ChallengeConfig,
}

impl IssueConfig {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let domain = cli.domain.trim().to_lowercase();
        if !is_valid_domain(&domain) {
            anyhow::bail!("Invalid domain: {:?}", cli.domain);
        }

        let email = cli.email.trim().to_string();
        if !email.contains('@') {
            anyhow::bail!("Invalid email: {:?}", cli.email);
        }

        let key = cli.alidns_key.as_deref().filter(|s| !s.is_empty());
        let secret = cli.alidns_secret.as_deref().filter(|s| !s.is_empty());
        let credentials = match (key, secret) {
            (Some(k), Some(s)) => Some((k.to_string(), s.to_string())),
            (None, None) => None,
            _ => anyhow::bail!("--alidns-key and --alidns-secret must be given together"),
        };

        let challenge = match credentials {
            Some((access_key_id, access_key_secret)) if !cli.manual_dns => {
                ChallengeConfig::Dns01AliDns {
                    access_key_id,
                    access_key_secret,
                }
            }
            _ if cli.dns || cli.manual_dns => ChallengeConfig::Dns01Manual,
            _ => ChallengeConfig::Http01 { port: cli.port },
        };

        Ok(Self {
            domain,
            email,
            cert_dir: cli.cert_dir.clone(),
            staging: cli.staging,
            challenge,
        })
    }
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Value of `--env-file` from raw arguments, before clap runs
pub fn env_file_arg<I: IntoIterator<Item = OsString>>(args: I) -> Option<PathBuf> {
    let mut args = args.into_iter().map(|a| a.to_string_lossy().into_owned());
    while let Some(arg) = args.next() {
        if arg == "--env-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// Load KEY=VALUE pairs into the process environment. Variables that are
/// already set win. Returns the number of variables set.
pub fn load_dotenv(path: &Path) -> std::io::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let mut loaded = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if std::env::var(key).is_err() {
                // SAFETY: called from main before the runtime spawns any threads
                unsafe { std::env::set_var(key, value) };
                loaded += 1;
            }
        }
    }
    Ok(loaded)
}
