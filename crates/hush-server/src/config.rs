use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::warn;

use hush_db::ProtocolConfig;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

const TOKEN_TTL_DAYS: RangeInclusive<i64> = 1..=3650;
const UNMASK_RETRY_AFTER_HOURS: RangeInclusive<i64> = 0..=87_600;

/// Server settings, read from `HUSH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    pub max_content_len: usize,
    pub protocol: ProtocolConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().filter(|(key, _)| key.starts_with("HUSH_")).collect())
    }

    fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let jwt_secret = match get("HUSH_JWT_SECRET") {
            Some(secret) => secret.to_string(),
            None => {
                warn!("HUSH_JWT_SECRET not set, using the development secret");
                DEV_JWT_SECRET.to_string()
            }
        };

        let unmask_retry_after = get("HUSH_UNMASK_RETRY_AFTER_HOURS")
            .map(|raw| parse_within("HUSH_UNMASK_RETRY_AFTER_HOURS", raw, UNMASK_RETRY_AFTER_HOURS))
            .transpose()?
            .map(chrono::Duration::hours);

        let token_ttl_days = get("HUSH_TOKEN_TTL_DAYS")
            .map_or(Ok(30), |raw| parse_within("HUSH_TOKEN_TTL_DAYS", raw, TOKEN_TTL_DAYS))?;

        let max_content_len: usize =
            get("HUSH_MAX_CONTENT_LEN").map_or(Ok(2000), |raw| parse("HUSH_MAX_CONTENT_LEN", raw))?;
        if max_content_len == 0 {
            bail!("HUSH_MAX_CONTENT_LEN must be at least 1");
        }

        Ok(Self {
            host: get("HUSH_HOST").unwrap_or("0.0.0.0").to_string(),
            port: get("HUSH_PORT").map_or(Ok(3000), |raw| parse("HUSH_PORT", raw))?,
            db_path: PathBuf::from(get("HUSH_DB_PATH").unwrap_or("hush.db")),
            jwt_secret,
            token_ttl_days,
            max_content_len,
            protocol: ProtocolConfig {
                unmask_retry_after,
                busy_retries: get("HUSH_DB_BUSY_RETRIES").map_or(Ok(5), |raw| parse("HUSH_DB_BUSY_RETRIES", raw))?,
            },
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().with_context(|| format!("{} has invalid value '{}'", key, raw))
}

fn parse_within(key: &str, raw: &str, range: RangeInclusive<i64>) -> Result<i64> {
    let value: i64 = parse(key, raw)?;
    if !range.contains(&value) {
        bail!("{} must be between {} and {}, got {}", key, range.start(), range.end(), value);
    }
    Ok(value)
}
