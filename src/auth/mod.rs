//! Vendor authentication machines and the credential state they produce.
//!
//! Each vendor handshake runs as its own state-machine task, spawned by the
//! session's single-flight `authenticate`. On success it delivers a
//! [`Credentials`] snapshot; the session installs the snapshot and attaches
//! it to every subsequent request.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};

use crate::http::HttpRequest;

pub(crate) mod digest;
pub(crate) mod oauth2;
pub mod scram;

/// Which login handshake the session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// No handshake; the server accepts unauthenticated requests (or the
    /// transport layer injects credentials itself).
    #[default]
    None,
    /// SCRAM-SHA-256 challenge/response over HTTP.
    Scram,
    /// OAuth2 token exchange yielding a bearer token.
    OAuth2,
    /// Cookie bootstrap plus digest-scheme POST with HTTP Basic.
    CookieDigest,
}

/// Credential snapshot produced by a completed login handshake.
#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// Nothing to attach.
    None,
    /// `Authorization: Bearer` token with an expiry deadline.
    Bearer {
        token: String,
        expires: Option<DateTime<Utc>>,
    },
    /// Session cookies.
    Cookies(Vec<(String, String)>),
    /// HTTP Basic authorization plus session cookies.
    BasicWithCookies {
        authorization: String,
        cookies: Vec<(String, String)>,
    },
}

impl Credentials {
    /// Whether the snapshot is still usable.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        match self {
            Credentials::Bearer {
                expires: Some(expires),
                ..
            } => *expires > now,
            _ => true,
        }
    }

    /// Attach this snapshot to an outgoing request.
    pub(crate) fn apply(&self, mut request: HttpRequest) -> HttpRequest {
        match self {
            Credentials::None => {}
            Credentials::Bearer { token, .. } => {
                if !request.exclude_headers {
                    request
                        .headers
                        .push(("Authorization".to_string(), format!("Bearer {token}")));
                }
            }
            Credentials::Cookies(cookies) => {
                if !request.exclude_cookies {
                    request.cookies.extend(cookies.iter().cloned());
                }
            }
            Credentials::BasicWithCookies {
                authorization,
                cookies,
            } => {
                if !request.exclude_headers {
                    request
                        .headers
                        .push(("Authorization".to_string(), authorization.clone()));
                }
                if !request.exclude_cookies {
                    request.cookies.extend(cookies.iter().cloned());
                }
            }
        }
        request
    }
}

/// `Authorization: Basic` header value for a user/secret pair.
pub(crate) fn basic_authorization(user: &str, secret: &str) -> String {
    format!("Basic {}", B64.encode(format!("{user}:{secret}")))
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => write!(f, "Credentials::None"),
            Credentials::Bearer { expires, .. } => f
                .debug_struct("Credentials::Bearer")
                .field("token", &"<redacted>")
                .field("expires", expires)
                .finish(),
            Credentials::Cookies(cookies) => f
                .debug_struct("Credentials::Cookies")
                .field("count", &cookies.len())
                .finish(),
            Credentials::BasicWithCookies { cookies, .. } => f
                .debug_struct("Credentials::BasicWithCookies")
                .field("authorization", &"<redacted>")
                .field("cookies", &cookies.len())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn bearer_validity_tracks_expiry() {
        let now = Utc::now();
        let live = Credentials::Bearer {
            token: "abc".into(),
            expires: Some(now + TimeDelta::seconds(60)),
        };
        let dead = Credentials::Bearer {
            token: "abc".into(),
            expires: Some(now - TimeDelta::seconds(1)),
        };
        assert!(live.is_valid(now));
        assert!(!dead.is_valid(now));
        assert!(Credentials::None.is_valid(now));
    }

    #[test]
    fn bearer_attaches_an_authorization_header() {
        let creds = Credentials::Bearer {
            token: "tok".into(),
            expires: None,
        };
        let req = creds.apply(HttpRequest::get("about"));
        assert!(
            req.headers
                .iter()
                .any(|(n, v)| n == "Authorization" && v == "Bearer tok")
        );
    }

    #[test]
    fn pristine_requests_stay_pristine() {
        let creds = Credentials::BasicWithCookies {
            authorization: "Basic xyz".into(),
            cookies: vec![("s".into(), "1".into())],
        };
        let req = creds.apply(HttpRequest::get("prelogin").pristine());
        assert!(req.headers.is_empty());
        assert!(req.cookies.is_empty());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = Credentials::Bearer {
            token: "super-secret".into(),
            expires: None,
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret"));
    }
}
