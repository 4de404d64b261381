use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "changeme",
    "secret",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// CORS and WebSocket origin allowed to talk to us; any origin when unset.
    pub allowed_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = var("PARLOR_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLOR_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let port = match var("PARLOR_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("PARLOR_PORT '{}' is not a valid port", raw))?,
            None => 8000,
        };

        Ok(Self {
            host: var("PARLOR_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: var("PARLOR_DB_PATH").unwrap_or_else(|| "parlor.db".into()).into(),
            jwt_secret,
            allowed_origin: var("PARLOR_ALLOWED_ORIGIN").filter(|o| !o.trim().is_empty()),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
