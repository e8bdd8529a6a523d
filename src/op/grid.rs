//! Grid-returning server calls, with a shared response cache.
//!
//! A [`GridOp`] wraps one GET or POST against an API verb, decodes the
//! response into grids and routes in-band error grids into the error
//! taxonomy. Cacheable GETs share a per-session cache keyed on the verb and
//! its canonicalised arguments; concurrent identical requests collapse onto
//! the first in-flight one instead of hitting the server again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{Error, OpHandle, ProtocolError};
use crate::grid::{Grid, GridFormat};
use crate::http::{HttpRequest, HttpResponse, Method};
use crate::session::SessionInner;

use super::base::{AuthedOp, CacheOutcome, spawn_op};

/// What a grid operation delivers.
#[derive(Debug, Clone)]
pub enum GridPayload {
    /// The decoded grid of a single-grid response.
    Single(Grid),
    /// All grids of a multi-grid response.
    Multi(Vec<Grid>),
    /// The raw response, undecoded.
    Raw(HttpResponse),
}

impl GridPayload {
    /// The single grid, or a protocol error for any other shape.
    pub fn into_single(self) -> Result<Grid, Error> {
        match self {
            GridPayload::Single(grid) => Ok(grid),
            other => Err(ProtocolError::Malformed {
                message: format!("expected a single grid, got {}", other.shape()),
            }
            .into()),
        }
    }

    /// All grids, or a protocol error for a raw payload.
    pub fn into_multi(self) -> Result<Vec<Grid>, Error> {
        match self {
            GridPayload::Single(grid) => Ok(vec![grid]),
            GridPayload::Multi(grids) => Ok(grids),
            GridPayload::Raw(_) => Err(ProtocolError::Malformed {
                message: "expected decoded grids, got a raw response".to_string(),
            }
            .into()),
        }
    }

    /// The raw response, or a protocol error for a decoded payload.
    pub fn into_raw(self) -> Result<HttpResponse, Error> {
        match self {
            GridPayload::Raw(response) => Ok(response),
            other => Err(ProtocolError::Malformed {
                message: format!("expected a raw response, got {}", other.shape()),
            }
            .into()),
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            GridPayload::Single(_) => "a single grid",
            GridPayload::Multi(_) => "multiple grids",
            GridPayload::Raw(_) => "a raw response",
        }
    }
}

/// One cache slot: either a completed payload or a claim by the in-flight
/// operation that will produce it.
pub(crate) struct CacheEntry {
    pub(crate) owner: Option<OpHandle<GridPayload>>,
    pub(crate) expires: Instant,
    pub(crate) payload: Option<GridPayload>,
}

pub(crate) type GridCache = Mutex<HashMap<String, CacheEntry>>;

/// A single GET or POST returning grids.
pub(crate) struct GridOp {
    session: Arc<SessionInner>,
    verb: String,
    method: Method,
    args: Vec<(String, String)>,
    body: Option<Grid>,
    format: GridFormat,
    multi_grid: bool,
    raw_response: bool,
    cache: bool,
    accept_status: Vec<u16>,
}

impl GridOp {
    /// A GET against an API verb with canonicalised arguments.
    pub(crate) fn get(
        session: Arc<SessionInner>,
        verb: impl Into<String>,
        args: Vec<(String, String)>,
    ) -> Self {
        Self::new(session, verb, Method::Get, args, None)
    }

    /// A POST of a request grid against an API verb.
    pub(crate) fn post(session: Arc<SessionInner>, verb: impl Into<String>, body: Grid) -> Self {
        Self::new(session, verb, Method::Post, Vec::new(), Some(body))
    }

    fn new(
        session: Arc<SessionInner>,
        verb: impl Into<String>,
        method: Method,
        args: Vec<(String, String)>,
        body: Option<Grid>,
    ) -> Self {
        let format = session.grid_format();
        Self {
            session,
            verb: verb.into(),
            method,
            args,
            body,
            format,
            multi_grid: false,
            raw_response: false,
            cache: false,
            accept_status: Vec::new(),
        }
    }

    /// Expect (and deliver) every grid of a multi-grid response.
    pub(crate) fn multi(mut self) -> Self {
        self.multi_grid = true;
        self
    }

    /// Deliver the raw response without decoding.
    pub(crate) fn raw(mut self) -> Self {
        self.raw_response = true;
        self
    }

    /// Serve this request from the session's grid cache when fresh, and
    /// publish the response into it.
    pub(crate) fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Accept these status codes in addition to 2xx.
    pub(crate) fn accept_status(mut self, statuses: &[u16]) -> Self {
        self.accept_status.extend_from_slice(statuses);
        self
    }

    /// Spawn the driver and return the result handle.
    pub(crate) fn spawn(self) -> OpHandle<GridPayload> {
        let retries = self.session.config().retries;
        let policy = self.session.config().retry_policy.clone();
        spawn_op(self, retries, policy)
    }

    /// Cache key: verb plus arguments in a deterministic order, so two
    /// calls with the same arguments in a different order share a slot.
    fn cache_key(&self) -> String {
        let mut args = self.args.clone();
        args.sort();
        let mut key = self.verb.clone();
        for (name, value) in args {
            key.push('\u{1}');
            key.push_str(&name);
            key.push('=');
            key.push_str(&value);
        }
        key
    }

    fn decode_response(&self, response: HttpResponse) -> Result<GridPayload, Error> {
        if self.raw_response {
            return Ok(GridPayload::Raw(response));
        }
        let format = match response.content_type() {
            Some("text/zinc") | Some("text/plain") => GridFormat::Zinc,
            Some("application/json") => GridFormat::Json,
            // An HTML body here is a login page: the session expired
            // between the auth check and the request landing.
            Some("text/html") => {
                return Err(Error::auth("server returned a login page"));
            }
            other => {
                return Err(ProtocolError::UnrecognizedContentType {
                    content_type: other.unwrap_or("").to_string(),
                }
                .into());
            }
        };
        let grids = self.session.codec().decode(&response.text(), format)?;
        // Every decoded grid is checked for an in-band error, multi-grid
        // responses included.
        for grid in &grids {
            if let Some((dis, traceback)) = grid.error() {
                return Err(ProtocolError::Server { dis, traceback }.into());
            }
        }
        if self.multi_grid {
            return Ok(GridPayload::Multi(grids));
        }
        let grid = grids.into_iter().next().ok_or(ProtocolError::Malformed {
            message: "response contained no grid".to_string(),
        })?;
        Ok(GridPayload::Single(grid))
    }
}

#[async_trait]
impl AuthedOp for GridOp {
    type Output = GridPayload;

    fn session(&self) -> &Arc<SessionInner> {
        &self.session
    }

    fn name(&self) -> &str {
        &self.verb
    }

    async fn check_cache(
        &mut self,
        own_handle: &OpHandle<GridPayload>,
    ) -> Result<CacheOutcome<GridPayload>, Error> {
        if !self.cache {
            return Ok(CacheOutcome::Miss);
        }
        let key = self.cache_key();
        let now = Instant::now();
        let mut cache = self.session.grid_cache().lock();

        if let Some(entry) = cache.get(&key) {
            if entry.expires > now {
                if let Some(payload) = &entry.payload {
                    tracing::debug!(verb = %self.verb, "served from grid cache");
                    return Ok(CacheOutcome::Hit(payload.clone()));
                }
                if let Some(owner) = &entry.owner {
                    if !owner.same_op(own_handle) {
                        return Ok(CacheOutcome::Piggyback(owner.clone()));
                    }
                    // Our own claim from a previous attempt; submit again.
                    return Ok(CacheOutcome::Miss);
                }
            }
        }

        // Claim the slot. If this operation ends up failing, release the
        // claim so later calls go back to the server.
        cache.insert(
            key.clone(),
            CacheEntry {
                owner: Some(own_handle.clone()),
                expires: now + self.session.config().cache_ttl,
                payload: None,
            },
        );
        drop(cache);

        let session = Arc::clone(&self.session);
        let claim = own_handle.clone();
        own_handle.subscribe(move |result| {
            if result.is_err() {
                let mut cache = session.grid_cache().lock();
                if let Some(entry) = cache.get(&key) {
                    if entry.owner.as_ref().is_some_and(|o| o.same_op(&claim)) {
                        cache.remove(&key);
                    }
                }
            }
        });
        Ok(CacheOutcome::Miss)
    }

    async fn submit(&mut self) -> Result<GridPayload, Error> {
        let path = self.session.api_path(&self.verb);
        let request = match self.method {
            Method::Get => HttpRequest::get(path)
                .params(self.args.iter().cloned())
                .header("Accept", self.format.mime()),
            Method::Post => {
                let body = match &self.body {
                    Some(grid) => self.session.codec().encode(grid, self.format)?,
                    None => String::new(),
                };
                HttpRequest::post(path)
                    .header("Accept", self.format.mime())
                    .body(body.into_bytes(), self.format.mime())
            }
        }
        .accept_status(&self.accept_status);

        let response = self.session.request(request).await?;
        let payload = self.decode_response(response)?;

        if self.cache {
            let key = self.cache_key();
            let mut cache = self.session.grid_cache().lock();
            cache.insert(
                key,
                CacheEntry {
                    owner: None,
                    expires: Instant::now() + self.session.config().cache_ttl,
                    payload: Some(payload.clone()),
                },
            );
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransportError;
    use crate::session::Session;

    const EMPTY: &str = r#"{"meta":{"ver":"3.0"},"cols":[{"name":"empty"}],"rows":[]}"#;

    struct OfflineTransport;

    #[async_trait]
    impl crate::http::HttpTransport for OfflineTransport {
        async fn roundtrip(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Err(TransportError::Connection {
                message: "offline".to_string(),
            })
        }
    }

    fn test_op(verb: &str, args: Vec<(String, String)>) -> GridOp {
        let session = Session::builder("http://test.local/")
            .transport(Arc::new(OfflineTransport))
            .build()
            .unwrap();
        GridOp::get(session.share(), verb, args)
    }

    fn json_response(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            cookies: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn cache_keys_ignore_argument_order() {
        let ab = test_op(
            "read",
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
        );
        let ba = test_op(
            "read",
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ],
        );
        assert_eq!(ab.cache_key(), ba.cache_key());
        assert_ne!(ab.cache_key(), test_op("read", Vec::new()).cache_key());
    }

    #[test]
    fn multi_grid_responses_keep_every_grid() {
        let op = test_op("read", Vec::new()).multi();
        let payload = op.decode_response(json_response(&format!("[{EMPTY},{EMPTY}]"))).unwrap();
        assert_eq!(payload.into_multi().unwrap().len(), 2);
    }

    #[test]
    fn an_err_grid_inside_a_multi_grid_response_is_a_server_error() {
        let failed = r#"{"meta":{"ver":"3.0","err":"m:","dis":"His read failed"},
                         "cols":[{"name":"empty"}],"rows":[]}"#;
        let op = test_op("hisRead", Vec::new()).multi();
        let err = op
            .decode_response(json_response(&format!("[{EMPTY},{failed}]")))
            .unwrap_err();
        assert_eq!(
            err,
            Error::Protocol(ProtocolError::Server {
                dis: "His read failed".to_string(),
                traceback: None,
            })
        );
    }

    #[test]
    fn raw_responses_skip_decoding_entirely() {
        let op = test_op("export", Vec::new()).raw();
        let response = HttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/csv".to_string())],
            cookies: Vec::new(),
            body: b"ts,val\n".to_vec(),
        };
        let payload = op.decode_response(response).unwrap();
        let raw = payload.into_raw().unwrap();
        assert_eq!(raw.text(), "ts,val\n");
    }

    #[test]
    fn a_single_grid_is_not_a_raw_response() {
        let op = test_op("read", Vec::new());
        let payload = op.decode_response(json_response(EMPTY)).unwrap();
        assert!(payload.into_raw().is_err());
    }
}
