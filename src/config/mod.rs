//! Environment-driven configuration.
//!
//! Every knob has a dev default; in prod every variable must be set
//! explicitly.

use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

/// Token signing keys. RSA keys live in PEM files; the symmetric
/// variant exists for tests and single-node setups.
#[derive(Debug, Clone)]
pub enum JwtKeyConfig {
    Rs256 {
        private_key_path: String,
        public_key_path: String,
    },
    Hs256 {
        secret: String,
    },
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Fixed-window length for the per-tenant API quotas.
    pub interval_seconds: u64,
    /// Weight applied to plans without an explicit entry.
    pub default_weight: f64,
    /// Per-plan weight overrides.
    pub weights: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct DevAuthConfig {
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub jwt: JwtKeyConfig,
    /// Issuer claim stamped into every token.
    pub jwt_issuer: String,
    /// Token lifetime in seconds.
    pub jwt_expiration_seconds: i64,
    /// Tenant token assumed when a device supplies none.
    pub default_tenant_token: String,
    pub enable_reporting: bool,
    pub have_addons: bool,
    pub rate_limit: RateLimitConfig,
}

impl DevAuthConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str.parse().map_err(|e: String| anyhow::anyhow!(e))?;

        let is_prod = environment == Environment::Prod;

        let jwt = match get_env("JWT_HS256_SECRET", Some(""), is_prod)? {
            secret if !secret.is_empty() => JwtKeyConfig::Hs256 { secret },
            _ => JwtKeyConfig::Rs256 {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
            },
        };

        let config = DevAuthConfig {
            environment,
            service_name: get_env("SERVICE_NAME", Some("deviceauth"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            jwt,
            jwt_issuer: get_env("JWT_ISSUER", Some("deviceauth"), is_prod)?,
            jwt_expiration_seconds: get_env("JWT_EXPIRATION_SECONDS", Some("604800"), is_prod)?
                .parse()
                .map_err(|e: std::num::ParseIntError| anyhow::anyhow!(e.to_string()))?,
            default_tenant_token: get_env("DEFAULT_TENANT_TOKEN", Some(""), is_prod)?,
            enable_reporting: get_env("ENABLE_REPORTING", Some("false"), is_prod)?
                .parse()
                .unwrap_or(false),
            have_addons: get_env("HAVE_ADDONS", Some("false"), is_prod)?
                .parse()
                .unwrap_or(false),
            rate_limit: RateLimitConfig {
                interval_seconds: get_env("RATE_LIMIT_INTERVAL_SECONDS", Some("60"), is_prod)?
                    .parse()
                    .unwrap_or(60),
                default_weight: get_env("RATE_LIMIT_DEFAULT_WEIGHT", Some("1.0"), is_prod)?
                    .parse()
                    .unwrap_or(1.0),
                weights: parse_weights(&get_env("RATE_LIMIT_PLAN_WEIGHTS", Some(""), is_prod)?)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.jwt_expiration_seconds <= 0 {
            anyhow::bail!("JWT_EXPIRATION_SECONDS must be positive");
        }
        if self.rate_limit.interval_seconds == 0 {
            anyhow::bail!("RATE_LIMIT_INTERVAL_SECONDS must be greater than 0");
        }
        if self.rate_limit.default_weight <= 0.0 {
            anyhow::bail!("RATE_LIMIT_DEFAULT_WEIGHT must be positive");
        }
        Ok(())
    }
}

/// Parse "plan=weight,plan=weight" pairs.
fn parse_weights(raw: &str) -> Result<HashMap<String, f64>, anyhow::Error> {
    let mut weights = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (plan, weight) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid plan weight entry: {}", pair))?;
        let weight: f64 = weight
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid weight for plan {}: {}", plan, e))?;
        if weight <= 0.0 {
            anyhow::bail!("weight for plan {} must be positive", plan);
        }
        weights.insert(plan.trim().to_string(), weight);
    }
    Ok(weights)
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, anyhow::Error> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(anyhow::anyhow!("{} is required in production but not set", key))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(anyhow::anyhow!("{} is required but not set", key))
            }
        }
    }
}
