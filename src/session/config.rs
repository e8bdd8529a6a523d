//! Session configuration and its builder.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::auth::AuthMethod;
use crate::grid::GridFormat;
use crate::op::RetryPolicy;

/// Configuration problems reported by [`SessionBuilder::build`].
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid base URI: {message}")]
    InvalidUri { message: String },

    #[error("{field} is required for {method}")]
    MissingField {
        field: &'static str,
        method: &'static str,
    },

    #[error("no HTTP transport configured and no default available")]
    NoTransport,
}

/// Validated session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server base URI, always with a trailing slash.
    pub base_uri: String,
    /// Path prefix for API verbs, relative to the base URI.
    pub api_dir: String,
    pub username: String,
    pub password: String,
    /// OAuth2 client credentials.
    pub client_id: String,
    pub client_secret: String,
    /// OAuth2 token endpoint, relative to the base URI.
    pub token_path: String,
    pub auth_method: AuthMethod,
    /// Wire encoding requested for grid exchanges.
    pub format: GridFormat,
    /// Freshness window for cached grids.
    pub cache_ttl: Duration,
    /// Retry budget for transport failures; `retries = R` allows `R + 1`
    /// submission attempts.
    pub retries: u32,
    pub retry_policy: RetryPolicy,
    /// Per-request transport timeout.
    pub timeout: Duration,
    /// Enforce that the server nonce extends the client nonce during the
    /// challenge/response login. Some servers violate this; the default
    /// logs a warning instead of failing.
    pub strict_nonce: bool,
}

impl SessionConfig {
    pub(crate) fn validate(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_uri).map_err(|e| ConfigError::InvalidUri {
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUri {
                message: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        match self.auth_method {
            AuthMethod::None => {}
            AuthMethod::Scram | AuthMethod::CookieDigest => {
                let method = match self.auth_method {
                    AuthMethod::Scram => "the challenge/response login",
                    _ => "the cookie login",
                };
                if self.username.is_empty() {
                    return Err(ConfigError::MissingField {
                        field: "username",
                        method,
                    });
                }
                if self.password.is_empty() {
                    return Err(ConfigError::MissingField {
                        field: "password",
                        method,
                    });
                }
            }
            AuthMethod::OAuth2 => {
                if self.client_id.is_empty() {
                    return Err(ConfigError::MissingField {
                        field: "client_id",
                        method: "the OAuth2 login",
                    });
                }
                if self.client_secret.is_empty() {
                    return Err(ConfigError::MissingField {
                        field: "client_secret",
                        method: "the OAuth2 login",
                    });
                }
            }
        }
        Ok(url)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_uri: String::new(),
            api_dir: "haystack".to_string(),
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            token_path: "oauth2/token".to_string(),
            auth_method: AuthMethod::None,
            format: GridFormat::Json,
            cache_ttl: Duration::from_secs(3600),
            retries: 2,
            retry_policy: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            strict_nonce: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(method: AuthMethod) -> SessionConfig {
        SessionConfig {
            base_uri: "http://demo.example/".to_string(),
            auth_method: method,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn base_uri_must_be_http() {
        let mut cfg = config(AuthMethod::None);
        assert!(cfg.validate().is_ok());
        cfg.base_uri = "ftp://demo.example/".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidUri { .. })
        ));
        cfg.base_uri = "not a uri".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidUri { .. })
        ));
    }

    #[test]
    fn password_logins_require_credentials() {
        let cfg = config(AuthMethod::Scram);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingField {
                field: "username",
                method: "the challenge/response login",
            })
        );
    }

    #[test]
    fn oauth2_requires_client_credentials() {
        let mut cfg = config(AuthMethod::OAuth2);
        cfg.client_id = "client".to_string();
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingField {
                field: "client_secret",
                method: "the OAuth2 login",
            })
        );
    }
}
