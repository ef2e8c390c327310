use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::error::Error;

pub const DEFAULT_PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub admin_password: String,
    pub bind_addr: String,
    pub push_endpoint: String,
    pub push_timeout: Duration,
    pub pool_size: u32,
}

impl Config {
    /// Reads configuration from the environment, after loading `.env` if present.
    pub fn load() -> Result<Self, Error> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            admin_password: required("ADMIN_PASSWORD")?,
            bind_addr: try_load("BIND_ADDR", "127.0.0.1:3000")?,
            push_endpoint: try_load("PUSH_ENDPOINT", DEFAULT_PUSH_ENDPOINT)?,
            push_timeout: Duration::from_secs(try_load("PUSH_TIMEOUT_SECS", "10")?),
            pool_size: try_load_nonzero("POOL_SIZE", "8")?,
        })
    }
}

fn try_load_nonzero(key: &str, default: &str) -> Result<u32, Error> {
    match try_load(key, default)? {
        0 => Err(Error::Config(format!("{key} must be at least 1"))),
        value => Ok(value),
    }
}

fn required(key: &str) -> Result<String, Error> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::Config(format!("{key} must be set in .env"))),
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, Error>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        Error::Config(format!("invalid {key}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_load_falls_back_to_default() {
        let port: u16 = try_load("TOURNEY_OPS_TEST_UNSET_PORT", "3000").unwrap();
        assert_eq!(port, 3000);
    }

    #[test]
    fn test_try_load_rejects_bad_default() {
        let result: Result<u32, Error> = try_load("TOURNEY_OPS_TEST_UNSET_SIZE", "eight");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_pool_size_is_a_config_error() {
        let result = try_load_nonzero("TOURNEY_OPS_TEST_UNSET_POOL", "0");
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(try_load_nonzero("TOURNEY_OPS_TEST_UNSET_POOL", "4").unwrap(), 4);
    }

    #[test]
    fn test_required_reports_missing_key() {
        let err = required("TOURNEY_OPS_TEST_UNSET_URL").expect_err("should be missing");
        assert!(err.to_string().contains("TOURNEY_OPS_TEST_UNSET_URL"));
    }
}
