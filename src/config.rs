use std::time::Duration;

use serde::Deserialize;

const PLACEHOLDER_KEY: &str = "CHANGE_ME_32_BYTE_HEX_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub store_backend: StoreBackend,
    pub db_max_connections: u32,
    /// AES-256 key for token ciphertexts, 64 hex chars.
    pub master_key: String,
    /// Length of generated tokens. Set via DEVICELOCK_TOKEN_LENGTH. Default: 12.
    pub token_length: usize,
    /// Uniqueness retries before issuance gives up. Default: 8.
    pub max_generation_attempts: u32,
    /// Applied when an issue request carries no expiration. None = never.
    pub default_expiry_days: Option<u32>,
    /// Upper bound for one validation transaction, lock wait included.
    pub tx_timeout_ms: u64,
    /// Version reported by the version-check endpoint.
    pub current_version: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    pub fn uses_placeholder_key(&self) -> bool {
        self.master_key == PLACEHOLDER_KEY
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Builds the config from an arbitrary key lookup; `load` passes the
/// process environment.
pub fn from_lookup<F>(get: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let master_key = get("DEVICELOCK_MASTER_KEY").unwrap_or_else(|| PLACEHOLDER_KEY.into());

    if master_key == PLACEHOLDER_KEY {
        let env_mode = get("DEVICELOCK_ENV")
            .or_else(|| get("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "DEVICELOCK_MASTER_KEY is still the insecure placeholder. \
                 Set a proper 64-char hex key before running in production."
            );
        }
    }

    let store_backend = match get("DEVICELOCK_STORE").as_deref().map(str::trim) {
        None | Some("") | Some("postgres") => StoreBackend::Postgres,
        Some("memory") => StoreBackend::Memory,
        Some(other) => anyhow::bail!("unknown DEVICELOCK_STORE '{}': expected postgres or memory", other),
    };

    let log_format = match get("DEVICELOCK_LOG_FORMAT").as_deref() {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };

    let token_length: usize = parsed(&get, "DEVICELOCK_TOKEN_LENGTH").unwrap_or(12);
    if token_length < 8 {
        anyhow::bail!("DEVICELOCK_TOKEN_LENGTH must be at least 8, got {}", token_length);
    }

    let max_generation_attempts: u32 = parsed(&get, "DEVICELOCK_MAX_GENERATION_ATTEMPTS").unwrap_or(8);
    if max_generation_attempts == 0 {
        anyhow::bail!("DEVICELOCK_MAX_GENERATION_ATTEMPTS must be at least 1");
    }

    Ok(Config {
        port: parsed(&get, "DEVICELOCK_PORT").unwrap_or(8080),
        database_url: get("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/devicelock".into()),
        store_backend,
        db_max_connections: parsed(&get, "DEVICELOCK_DB_MAX_CONNECTIONS").unwrap_or(10),
        master_key,
        token_length,
        max_generation_attempts,
        default_expiry_days: parsed(&get, "DEVICELOCK_DEFAULT_EXPIRY_DAYS"),
        tx_timeout_ms: parsed(&get, "DEVICELOCK_TX_TIMEOUT_MS").unwrap_or(5000),
        current_version: get("DEVICELOCK_CURRENT_VERSION")
            .or_else(|| get("VERSION"))
            .or_else(|| get("APP_VERSION"))
            .unwrap_or_else(|| "2.0.0".into()),
        log_format,
    })
}

fn parsed<F, T>(get: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    get(key).and_then(|v| v.trim().parse().ok())
}
