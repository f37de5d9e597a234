use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

/// A configuration value that must not show up in logs.
#[derive(Clone, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "Secret(<unset>)")
        } else {
            write!(f, "Secret(***)")
        }
    }
}

/// Credentials and limits for the hosted media store.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub api_base: String,
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: Secret,
    pub timeout: Duration,
}

/// How bearer tokens are verified.
///
/// With `public_key_pem` set, tokens must be RS256-signed by the matching
/// private key and `secret` is ignored. Otherwise they are HS256 with `secret`.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: Secret,
    pub public_key_pem: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub staging_dir: String,
    /// Origins allowed by CORS. A single `*` allows any origin.
    pub cors_origins: Vec<String>,
    /// Emails granted the admin role at startup.
    pub admin_emails: Vec<String>,
    pub token: TokenConfig,
    pub media: MediaConfig,
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
    pub purge_test_fixtures: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Song catalog API")]
pub struct Args {
    /// Host to bind to (overrides CATALOG_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CATALOG_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploads are staged (overrides CATALOG_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides CATALOG_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Skip deleting test-fixture songs at startup
    #[arg(long)]
    pub skip_fixture_purge: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_args(args)?;
        Ok((cfg, migrate))
    }

    fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("CATALOG_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("CATALOG_PORT", 5000u16)?;
        let env_staging =
            env::var("CATALOG_STAGING_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("CATALOG_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/catalog.db".into());
        let env_purge = env_parse("CATALOG_PURGE_TEST_FIXTURES", true)?;

        let public_key_pem = match env::var("CATALOG_TOKEN_PUBLIC_KEY_FILE") {
            Ok(path) if !path.trim().is_empty() => Some(
                std::fs::read_to_string(path.trim())
                    .with_context(|| format!("reading token public key from {}", path))?,
            ),
            _ => None,
        };
        let token = TokenConfig {
            secret: Secret::new(env::var("CATALOG_TOKEN_SECRET").unwrap_or_default()),
            public_key_pem,
            issuer: env::var("CATALOG_TOKEN_ISSUER").ok().filter(|s| !s.is_empty()),
            audience: env::var("CATALOG_TOKEN_AUDIENCE")
                .ok()
                .filter(|s| !s.is_empty()),
        };

        let media = MediaConfig {
            api_base: env::var("CATALOG_MEDIA_API_BASE")
                .unwrap_or_else(|_| "https://api.cloudinary.com/v1_1".into()),
            cloud_name: env::var("CATALOG_MEDIA_CLOUD_NAME").unwrap_or_default(),
            api_key: env::var("CATALOG_MEDIA_API_KEY").unwrap_or_default(),
            api_secret: Secret::new(env::var("CATALOG_MEDIA_API_SECRET").unwrap_or_default()),
            timeout: Duration::from_secs(env_parse("CATALOG_MEDIA_TIMEOUT_SECS", 60u64)?),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            database_url: args.database_url.unwrap_or(env_db),
            cors_origins: split_list(
                &env::var("CATALOG_CORS_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000".into()),
            ),
            admin_emails: split_list(&env::var("CATALOG_ADMIN_EMAILS").unwrap_or_default())
                .into_iter()
                .map(|email| email.to_ascii_lowercase())
                .collect(),
            token,
            media,
            request_timeout: Duration::from_secs(env_parse(
                "CATALOG_REQUEST_TIMEOUT_SECS",
                120u64,
            )?),
            max_upload_bytes: env_parse("CATALOG_MAX_UPLOAD_BYTES", 50 * 1024 * 1024usize)?,
            purge_test_fixtures: env_purge && !args.skip_fixture_purge,
        };

        if cfg.token.secret.is_empty() && cfg.token.public_key_pem.is_none() {
            tracing::warn!(
                "neither CATALOG_TOKEN_SECRET nor CATALOG_TOKEN_PUBLIC_KEY_FILE is set; \
                 every bearer token will be rejected"
            );
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// Split a comma-separated list, dropping blanks.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
