//! reqwest-backed transport.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::TransportError;

use super::{HttpRequest, HttpResponse, HttpTransport, Method};

/// Production transport over a shared [`reqwest::Client`].
///
/// Cookies are attached explicitly by the session's credential state, so
/// the client's own cookie store stays disabled: what gets sent is exactly
/// what the operation asked for.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connection {
                message: format!("client construction failed: {e}"),
            })?;
        Ok(Self { client, timeout })
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        // The builder only fails when TLS backends are misconfigured at
        // compile time; with the bundled rustls config this cannot happen.
        Self::new(Duration::from_secs(30)).unwrap_or_else(|_| Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.uri),
            Method::Post => self.client.post(&request.uri),
        };

        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            let cookie_header = request
                .cookies
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header("Cookie", cookie_header);
        }
        if let Some(body_type) = &request.body_type {
            builder = builder.header("Content-Type", body_type.clone());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    after: self.timeout,
                }
            } else {
                TransportError::Connection {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = Vec::new();
        let mut cookies = Vec::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else { continue };
            let name = name.as_str().to_ascii_lowercase();
            if name == "set-cookie" {
                if let Some(pair) = parse_set_cookie(value) {
                    cookies.push(pair);
                }
            }
            headers.push((name, value.to_string()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Connection {
                message: format!("body read failed: {e}"),
            })?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            cookies,
            body,
        })
    }
}

/// `name=value` from a Set-Cookie header, attributes discarded.
fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let pair = value.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_parsing_discards_attributes() {
        assert_eq!(
            parse_set_cookie("JSESSIONID=abc123; Path=/; HttpOnly"),
            Some(("JSESSIONID".to_string(), "abc123".to_string()))
        );
        assert_eq!(parse_set_cookie("garbage"), None);
    }
}
