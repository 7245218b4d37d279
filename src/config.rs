use std::net::SocketAddr;

use clap::Parser;

/// Process-wide configuration, immutable after construction.
///
/// Loaded once at startup from environment variables (with CLI-flag
/// overrides via `clap`'s `env` feature), validated eagerly, then wrapped
/// in an `Arc` by the caller and never mutated again.
#[derive(Parser, Debug, Clone)]
#[command(name = "delegation-auth", about = "Agent delegation authorization service")]
pub struct Config {
    /// HMAC signing secret, must be at least 32 bytes.
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: String,

    /// Signing algorithm name. Only "HS256" is accepted for delegation
    /// and access tokens; DPoP proofs may additionally carry "RS256".
    #[arg(long, env = "JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    #[arg(long, env = "ACCESS_TOKEN_TTL_MINUTES", default_value_t = 5)]
    pub access_token_ttl_minutes: i64,

    #[arg(long, env = "DELEGATION_TOKEN_TTL_MINUTES", default_value_t = 10)]
    pub delegation_token_ttl_minutes: i64,

    #[arg(long, env = "AUTH_BIND", default_value = "0.0.0.0:8080")]
    pub auth_bind: SocketAddr,

    #[arg(long, env = "RESOURCE_BIND", default_value = "0.0.0.0:8081")]
    pub resource_bind: SocketAddr,

    #[arg(long, env = "MANAGEMENT_BIND", default_value = "0.0.0.0:8082")]
    pub management_bind: SocketAddr,

    /// Base URL of the authorization service, used as the `iss` claim and
    /// by the resource service to reach `/introspect`.
    #[arg(long, env = "AUTH_SERVER_URL", default_value = "http://localhost:8080")]
    pub auth_server_url: String,

    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = 120)]
    pub rate_limit_per_minute: u32,

    /// Enforce DPoP proofs on the resource endpoint.
    #[arg(long, env = "DPOP_REQUIRED", default_value_t = false)]
    pub dpop_required: bool,

    #[arg(long, env = "OIDC_ISSUER_URL")]
    pub oidc_issuer_url: Option<String>,

    #[arg(long, env = "OIDC_REALM")]
    pub oidc_realm: Option<String>,

    #[arg(long, env = "OIDC_CLIENT_ID")]
    pub oidc_client_id: Option<String>,

    #[arg(long, env = "OIDC_CLIENT_SECRET")]
    pub oidc_client_secret: Option<String>,

    #[arg(long, env = "OIDC_REDIRECT_URI")]
    pub oidc_redirect_uri: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Configuration error, mapped to exit code 1 by both binaries.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("jwt_secret must be at least 32 bytes, got {0}")]
    SecretTooShort(usize),
    #[error("unsupported jwt_algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("access_token_ttl_minutes must be positive")]
    NonPositiveAccessTtl,
    #[error("delegation_token_ttl_minutes must be positive")]
    NonPositiveDelegationTtl,
}

impl Config {
    /// Parse from CLI args/env and validate. Call once at process start.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < 32 {
            return Err(ConfigError::SecretTooShort(self.jwt_secret.len()));
        }
        if self.jwt_algorithm != "HS256" {
            return Err(ConfigError::UnsupportedAlgorithm(self.jwt_algorithm.clone()));
        }
        if self.access_token_ttl_minutes <= 0 {
            return Err(ConfigError::NonPositiveAccessTtl);
        }
        if self.delegation_token_ttl_minutes <= 0 {
            return Err(ConfigError::NonPositiveDelegationTtl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            jwt_secret: "x".repeat(32),
            jwt_algorithm: "HS256".into(),
            access_token_ttl_minutes: 5,
            delegation_token_ttl_minutes: 10,
            auth_bind: "0.0.0.0:8080".parse().unwrap(),
            resource_bind: "0.0.0.0:8081".parse().unwrap(),
            management_bind: "0.0.0.0:8082".parse().unwrap(),
            auth_server_url: "http://localhost:8080".into(),
            cors_origins: vec![],
            rate_limit_per_minute: 120,
            dpop_required: false,
            oidc_issuer_url: None,
            oidc_realm: None,
            oidc_client_id: None,
            oidc_client_secret: None,
            oidc_redirect_uri: None,
            log_level: "info".into(),
        }
    }

    #[test]
    fn rejects_short_secret() {
        let mut config = base();
        config.jwt_secret = "short".into();
        assert!(matches!(config.validate(), Err(ConfigError::SecretTooShort(5))));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let mut config = base();
        config.jwt_algorithm = "none".into();
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn accepts_valid_config() {
        assert!(base().validate().is_ok());
    }
}
