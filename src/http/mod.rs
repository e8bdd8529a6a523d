//! HTTP transport seam.
//!
//! The transport is a collaborator: operations describe a request with
//! [`HttpRequest`] and receive an [`HttpResponse`] (or a transport error)
//! without knowing which client performed it. The reqwest-backed
//! implementation lives behind the `reqwest-transport` feature.

use async_trait::async_trait;

use crate::core::TransportError;

#[cfg(feature = "reqwest-transport")]
mod reqwest_transport;
#[cfg(feature = "reqwest-transport")]
pub use reqwest_transport::ReqwestTransport;

/// HTTP verb. Only the two the protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A single request as the operation layer describes it.
///
/// `exclude_headers` / `exclude_cookies` suppress the session's default
/// credential attachment — authentication handshakes need pristine
/// requests.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute URI; the session resolves relative paths before dispatch.
    pub uri: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub body_type: Option<String>,
    /// Status codes accepted in addition to 2xx.
    pub accept_status: Vec<u16>,
    pub exclude_headers: bool,
    pub exclude_cookies: bool,
}

impl HttpRequest {
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::Get, uri)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(Method::Post, uri)
    }

    fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            params: Vec::new(),
            headers: Vec::new(),
            cookies: Vec::new(),
            body: None,
            body_type: None,
            accept_status: Vec::new(),
            exclude_headers: false,
            exclude_cookies: false,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>, body_type: impl Into<String>) -> Self {
        self.body = Some(body);
        self.body_type = Some(body_type.into());
        self
    }

    pub fn accept_status(mut self, statuses: &[u16]) -> Self {
        self.accept_status.extend_from_slice(statuses);
        self
    }

    /// Skip the session's default headers and cookies.
    pub fn pristine(mut self) -> Self {
        self.exclude_headers = true;
        self.exclude_cookies = true;
        self
    }
}

/// A response as the operation layer consumes it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased; repeated headers appear repeatedly.
    pub headers: Vec<(String, String)>,
    /// Cookies set by this response (name, value).
    pub cookies: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First header with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Cookie set by this response.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Content type with any parameters (charset, ...) stripped.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    /// Body as text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Enforce the 2xx-or-accepted status policy.
    pub fn check_status(&self, accept: &[u16]) -> Result<(), TransportError> {
        if (200..300).contains(&self.status) || accept.contains(&self.status) {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: self.status,
            })
        }
    }
}

/// Asynchronous HTTP client seam.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform one request/response exchange. Status-code policy is the
    /// caller's concern; only connection-level failures are errors here.
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, content_type: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![("content-type".into(), content_type.into())],
            cookies: vec![],
            body: b"{}".to_vec(),
        }
    }

    #[test]
    fn content_type_strips_parameters() {
        let resp = response(200, "text/zinc; charset=utf-8");
        assert_eq!(resp.content_type(), Some("text/zinc"));
    }

    #[test]
    fn status_policy_accepts_2xx_and_listed_codes() {
        assert!(response(204, "text/plain").check_status(&[]).is_ok());
        assert!(response(404, "text/plain").check_status(&[404]).is_ok());
        assert_eq!(
            response(500, "text/plain").check_status(&[404]),
            Err(TransportError::Status { status: 500 })
        );
    }
}
