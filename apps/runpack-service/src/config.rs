use std::env;
use std::net::{AddrParseError, SocketAddr};

use chrono::Duration;
use runpack_core::{Ttls, TtlConfigError};
use runpack_core::Money;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RUNPACK_BIND_ADDR: {0}")]
    BindAddr(#[from] AddrParseError),
    #[error("invalid RUNPACK_T_RES_SECONDS: {0}")]
    TRes(String),
    #[error("invalid RUNPACK_T_STUCK_SECONDS: {0}")]
    TStuck(String),
    #[error("invalid RUNPACK_LEASE_TTL_SECONDS: {0}")]
    LeaseTtl(String),
    #[error("invalid RUNPACK_SWEEP_PERIOD_SECONDS: {0}")]
    SweepPeriod(String),
    #[error("invalid RUNPACK_SOFT_LIMIT: {0}")]
    SoftLimit(String),
    #[error("invalid RUNPACK_MINIMUM_FEE: {0}")]
    MinimumFee(String),
    #[error("TTL configuration violates the ordering invariant: {0}")]
    TtlOrdering(#[from] TtlConfigError),
}

/// Immutable configuration assembled once at startup and threaded into every
/// component (spec.md §9, "no hidden globals"). Mirrors the teacher's
/// `Config::from_env` — one environment variable per field, one named error
/// variant per malformed value.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub service_name: String,
    pub database_url: Option<String>,
    pub ttls: Ttls,
    /// Soft-limit threshold a tenant's balance may be reserved down to
    /// (spec.md §3, Tenant.soft_limit_threshold). Negative or zero; `reserve`
    /// checks `balance - amount >= soft_limit`.
    pub default_soft_limit: Money,
    /// Minimum fee charged on failure-path finalizes (lease expiry,
    /// execution failure) when the source material leaves the exact value
    /// an implementer choice (spec.md §9, Open Question 2).
    pub default_minimum_fee: Money,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("RUNPACK_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;
        let service_name =
            env::var("RUNPACK_SERVICE_NAME").unwrap_or_else(|_| "runpack".to_string());
        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("DB_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let t_res_secs = parse_env_i64("RUNPACK_T_RES_SECONDS", 3_600, ConfigError::TRes)?;
        let t_stuck_secs = parse_env_i64("RUNPACK_T_STUCK_SECONDS", 300, ConfigError::TStuck)?;
        let lease_ttl_secs =
            parse_env_i64("RUNPACK_LEASE_TTL_SECONDS", 360, ConfigError::LeaseTtl)?;
        let sweep_period_secs =
            parse_env_i64("RUNPACK_SWEEP_PERIOD_SECONDS", 60, ConfigError::SweepPeriod)?;

        let ttls = Ttls {
            t_res: Duration::seconds(t_res_secs),
            t_stuck: Duration::seconds(t_stuck_secs),
            lease_ttl: Duration::seconds(lease_ttl_secs),
            sweep_period: Duration::seconds(sweep_period_secs),
        };
        ttls.validate()?;

        let default_soft_limit = env::var("RUNPACK_SOFT_LIMIT")
            .ok()
            .map(|value| Money::parse_fixed4(&value).map_err(|error| ConfigError::SoftLimit(error.to_string())))
            .transpose()?
            .unwrap_or(Money::ZERO);
        let default_minimum_fee = env::var("RUNPACK_MINIMUM_FEE")
            .ok()
            .map(|value| Money::parse_fixed4(&value).map_err(|error| ConfigError::MinimumFee(error.to_string())))
            .transpose()?
            .unwrap_or(Money::ZERO);

        Ok(Self {
            bind_addr,
            service_name,
            database_url,
            ttls,
            default_soft_limit,
            default_minimum_fee,
        })
    }
}

fn parse_env_i64(
    key: &'static str,
    default: i64,
    to_error: fn(String) -> ConfigError,
) -> Result<i64, ConfigError> {
    match env::var(key) {
        Ok(value) => value.parse::<i64>().map_err(|error| to_error(error.to_string())),
        Err(_) => Ok(default),
    }
}
