//! Session façade: verb-level API, credential state, shared caches.
//!
//! A [`Session`] owns the three pieces of state every operation shares:
//! the credential snapshot (written only by the single in-flight login
//! operation), the grid cache, and the entity table. Each verb method
//! builds the right operation, spawns its driver task, and returns the
//! operation's [`OpHandle`] so callers can block, await, or subscribe.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::{Mutex, RwLock};
use url::Url;

use crate::auth::{self, AuthMethod, Credentials};
use crate::core::{ContractError, Error, OpHandle};
use crate::grid::{Grid, GridCodec, GridFormat, JsonCodec, Row, Scalar};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::op::entity::{self, Entity, EntityMap};
use crate::op::feature::{self, FeatureMap};
use crate::op::grid::{GridCache, GridOp, GridPayload};
use crate::op::his::{self, HisRange};
use crate::op::RetryPolicy;

mod config;

pub use config::{ConfigError, SessionConfig};

/// Shared state behind a [`Session`]. Operation drivers hold an `Arc` to
/// this for the lifetime of their task.
pub struct SessionInner {
    config: SessionConfig,
    base: Url,
    transport: Arc<dyn HttpTransport>,
    codec: Arc<dyn GridCodec>,
    auth: RwLock<Option<Credentials>>,
    auth_op: Mutex<Option<OpHandle<Credentials>>>,
    grid_cache: GridCache,
    entities: Mutex<HashMap<String, Weak<Entity>>>,
}

impl SessionInner {
    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn codec(&self) -> &dyn GridCodec {
        self.codec.as_ref()
    }

    pub(crate) fn grid_format(&self) -> GridFormat {
        self.config.format
    }

    pub(crate) fn grid_cache(&self) -> &GridCache {
        &self.grid_cache
    }

    /// Path of an API verb relative to the base URI.
    pub(crate) fn api_path(&self, verb: &str) -> String {
        if self.config.api_dir.is_empty() {
            verb.to_string()
        } else {
            format!("{}/{verb}", self.config.api_dir)
        }
    }

    /// Resolve a path against the session base URI.
    pub(crate) fn resolve(&self, path: &str) -> Result<String, Error> {
        self.base
            .join(path)
            .map(Into::into)
            .map_err(|e| {
                ContractError::InvalidArgument {
                    message: format!("cannot resolve {path:?}: {e}"),
                }
                .into()
            })
    }

    /// Whether a usable credential snapshot is installed.
    pub(crate) fn is_authenticated(&self) -> bool {
        match self.config.auth_method {
            AuthMethod::None => true,
            _ => self
                .auth
                .read()
                .as_ref()
                .is_some_and(|c| c.is_valid(Utc::now())),
        }
    }

    /// Run (or join) the login handshake. Single-flight: while one login
    /// operation is in flight every caller receives the same handle, so at
    /// most one credential exchange hits the server. On success the
    /// credentials are installed before any waiter observes completion.
    pub(crate) fn authenticate(self: Arc<Self>) -> OpHandle<Credentials> {
        let mut slot = self.auth_op.lock();
        if let Some(existing) = &*slot {
            if !existing.is_done() {
                return existing.clone();
            }
        }
        tracing::debug!(method = ?self.config.auth_method, "starting login");
        let handle = match self.config.auth_method {
            AuthMethod::None => OpHandle::ready(Ok(Credentials::None)),
            AuthMethod::Scram => auth::scram::spawn_login(Arc::clone(&self)),
            AuthMethod::OAuth2 => auth::oauth2::spawn_login(Arc::clone(&self)),
            AuthMethod::CookieDigest => auth::digest::spawn_login(Arc::clone(&self)),
        };
        *slot = Some(handle.clone());
        drop(slot);

        let session = Arc::clone(&self);
        let me = handle.clone();
        handle.subscribe(move |result| {
            match result {
                Ok(creds) => {
                    *session.auth.write() = Some(creds.clone());
                    tracing::debug!("credentials installed");
                }
                Err(err) => tracing::warn!(error = %err, "login failed"),
            }
            let mut slot = session.auth_op.lock();
            if slot.as_ref().is_some_and(|h| h.same_op(&me)) {
                *slot = None;
            }
        });
        handle
    }

    /// Dispatch one request: resolve the URI, attach the credential
    /// snapshot (unless the request opted out), and enforce the status
    /// policy.
    pub(crate) async fn request(&self, mut request: HttpRequest) -> Result<HttpResponse, Error> {
        request.uri = self.resolve(&request.uri)?;
        let request = match &*self.auth.read() {
            Some(creds) => creds.apply(request),
            None => request,
        };
        let accept = request.accept_status.clone();
        let response = self.transport.roundtrip(request).await?;
        response.check_status(&accept)?;
        Ok(response)
    }

    /// Live entity from the table, pruning the slot if the caller dropped
    /// the last strong reference.
    pub(crate) fn cached_entity(&self, id: &str) -> Option<Arc<Entity>> {
        let mut table = self.entities.lock();
        match table.get(id).and_then(Weak::upgrade) {
            Some(entity) => Some(entity),
            None => {
                table.remove(id);
                None
            }
        }
    }

    pub(crate) fn store_entity(&self, entity: &Arc<Entity>) {
        self.entities
            .lock()
            .insert(entity.id().to_string(), Arc::downgrade(entity));
    }
}

/// A connection to one Project Haystack server.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder(base_uri: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(base_uri)
    }

    /// Run the configured login handshake now instead of waiting for the
    /// first operation to trigger it.
    pub fn authenticate(&self) -> OpHandle<Credentials> {
        Arc::clone(&self.inner).authenticate()
    }

    /// Server version information.
    pub fn about(&self) -> OpHandle<Grid> {
        single(GridOp::get(self.share(), "about", Vec::new()).cached().spawn())
    }

    /// Operations the server supports.
    pub fn ops(&self) -> OpHandle<Grid> {
        single(GridOp::get(self.share(), "ops", Vec::new()).cached().spawn())
    }

    /// Grid encodings the server supports.
    pub fn formats(&self) -> OpHandle<Grid> {
        single(GridOp::get(self.share(), "formats", Vec::new()).cached().spawn())
    }

    /// Entities matching a filter expression.
    pub fn read(&self, filter: &str, limit: Option<usize>) -> OpHandle<Grid> {
        let mut args = vec![arg("filter", Scalar::str(filter))];
        if let Some(limit) = limit {
            args.push(arg("limit", Scalar::num(limit as f64)));
        }
        single(GridOp::get(self.share(), "read", args).cached().spawn())
    }

    /// Entities by ID. A single ID becomes a GET; several become a POSTed
    /// ID grid.
    pub fn read_ids(&self, ids: &[&str]) -> OpHandle<Grid> {
        match ids {
            [] => OpHandle::ready(Err(ContractError::InvalidArgument {
                message: "read_ids requires at least one ID".to_string(),
            }
            .into())),
            [id] => single(
                GridOp::get(self.share(), "read", vec![arg("id", Scalar::make_ref(*id))])
                    .cached()
                    .spawn(),
            ),
            ids => single(GridOp::post(self.share(), "read", id_grid(ids)).spawn()),
        }
    }

    /// Navigate the project tree.
    pub fn nav(&self, nav_id: Option<&str>) -> OpHandle<Grid> {
        let args = match nav_id {
            Some(nav_id) => vec![arg("navId", Scalar::make_ref(nav_id))],
            None => Vec::new(),
        };
        single(GridOp::get(self.share(), "nav", args).cached().spawn())
    }

    /// Subscribe points to a watch, creating it if no watch ID is given.
    pub fn watch_sub(
        &self,
        points: &[&str],
        watch_id: Option<&str>,
        watch_dis: Option<&str>,
        lease_seconds: Option<f64>,
    ) -> OpHandle<Grid> {
        let mut grid = id_grid(points);
        if let Some(watch_id) = watch_id {
            grid.set_meta("watchId", Scalar::str(watch_id));
        }
        if let Some(watch_dis) = watch_dis {
            grid.set_meta("watchDis", Scalar::str(watch_dis));
        }
        if let Some(lease) = lease_seconds {
            grid.set_meta("lease", Scalar::Num(lease, Some("s".to_string())));
        }
        single(GridOp::post(self.share(), "watchSub", grid).spawn())
    }

    /// Remove points from a watch, or close it entirely when no points are
    /// given.
    pub fn watch_unsub(&self, watch_id: &str, points: Option<&[&str]>) -> OpHandle<Grid> {
        let mut grid = match points {
            Some(points) => id_grid(points),
            None => {
                let mut grid = Grid::new();
                grid.add_column("id");
                grid.set_meta("close", Scalar::Marker);
                grid
            }
        };
        grid.set_meta("watchId", Scalar::str(watch_id));
        single(GridOp::post(self.share(), "watchUnsub", grid).spawn())
    }

    /// Poll a watch for changed points; `refresh` requests every point's
    /// current value instead.
    pub fn watch_poll(&self, watch_id: &str, refresh: bool) -> OpHandle<Grid> {
        let mut grid = Grid::new();
        grid.add_column("empty");
        grid.set_meta("watchId", Scalar::str(watch_id));
        if refresh {
            grid.set_meta("refresh", Scalar::Marker);
        }
        single(GridOp::post(self.share(), "watchPoll", grid).spawn())
    }

    /// Write to (or, with no level, read the priority array of) a
    /// writeable point.
    pub fn point_write(
        &self,
        point: &str,
        level: Option<u32>,
        val: Option<Scalar>,
        who: Option<&str>,
        duration_seconds: Option<f64>,
    ) -> OpHandle<Grid> {
        let mut args = vec![arg("id", Scalar::make_ref(point))];
        match level {
            None => {
                if val.is_some() || who.is_some() || duration_seconds.is_some() {
                    return OpHandle::ready(Err(ContractError::InvalidArgument {
                        message: "without a level, val, who and duration must be omitted"
                            .to_string(),
                    }
                    .into()));
                }
            }
            Some(level) => {
                args.push(arg("level", Scalar::num(level as f64)));
                args.push(arg("val", val.unwrap_or(Scalar::Null)));
                if let Some(who) = who {
                    args.push(arg("who", Scalar::str(who)));
                }
                if let Some(duration) = duration_seconds {
                    args.push(arg("duration", Scalar::Num(duration, Some("s".to_string()))));
                }
            }
        }
        single(GridOp::get(self.share(), "pointWrite", args).spawn())
    }

    /// Historical samples for a point over a range.
    pub fn his_read(&self, point: &str, range: HisRange) -> OpHandle<Grid> {
        let args = vec![
            arg("id", Scalar::make_ref(point)),
            ("range".to_string(), range.to_wire()),
        ];
        single(GridOp::get(self.share(), "hisRead", args).cached().spawn())
    }

    /// Historical samples as a decoded `(timestamp, value)` series.
    pub fn his_read_series(
        &self,
        point: &str,
        range: HisRange,
    ) -> OpHandle<Vec<(DateTime<FixedOffset>, Scalar)>> {
        self.his_read(point, range)
            .map(|res| res.and_then(|grid| his::series_from_grid(&grid)))
    }

    /// Write a series of historical samples to a point. Records are
    /// submitted in timestamp order regardless of input order.
    pub fn his_write(
        &self,
        point: &str,
        mut records: Vec<(DateTime<FixedOffset>, Scalar)>,
    ) -> OpHandle<Grid> {
        records.sort_by_key(|(ts, _)| *ts);
        let mut grid = Grid::new();
        grid.set_meta("id", Scalar::make_ref(point));
        grid.add_column("ts");
        grid.add_column("val");
        for (ts, val) in records {
            let mut row = Row::new();
            row.insert("ts".to_string(), Scalar::DateTime(ts));
            row.insert("val".to_string(), val);
            grid.push_row(row);
        }
        single(GridOp::post(self.share(), "hisWrite", grid).spawn())
    }

    /// Invoke a user action on an entity.
    pub fn invoke_action(
        &self,
        entity: &str,
        action: &str,
        args: Vec<(String, Scalar)>,
    ) -> OpHandle<Grid> {
        let mut grid = Grid::new();
        grid.set_meta("id", Scalar::make_ref(entity));
        grid.set_meta("action", Scalar::str(action));
        let mut row = Row::new();
        for (name, value) in args {
            grid.add_column(name.clone());
            row.insert(name, value);
        }
        grid.push_row(row);
        single(GridOp::post(self.share(), "invokeAction", grid).spawn())
    }

    /// Fetch a path under the API directory without grid decoding, for
    /// vendor endpoints that return something other than a grid.
    pub fn get_raw(&self, path: &str, args: Vec<(String, String)>) -> OpHandle<HttpResponse> {
        GridOp::get(self.share(), path, args)
            .raw()
            .spawn()
            .map(|res| res.and_then(GridPayload::into_raw))
    }

    /// One entity by ID, from the entity table when fresh.
    pub fn get_entity(&self, id: &str, refresh: bool) -> OpHandle<Arc<Entity>> {
        entity::spawn_get_single(self.share(), id.to_string(), refresh)
    }

    /// Several entities by ID, keyed by ID in the result.
    pub fn get_entities(&self, ids: &[&str], refresh: bool) -> OpHandle<EntityMap> {
        let ids = ids.iter().map(|id| id.to_string()).collect();
        entity::spawn_get(self.share(), ids, refresh)
    }

    /// Entities matching a filter expression, as live [`Entity`] handles.
    pub fn find_entity(&self, filter: &str, limit: Option<usize>) -> OpHandle<EntityMap> {
        entity::spawn_find(self.share(), filter.to_string(), limit)
    }

    /// Which of the named features the server supports.
    pub fn has_features(&self, features: &[&str]) -> OpHandle<FeatureMap> {
        let features = features.iter().map(|f| f.to_string()).collect();
        feature::spawn(self.share(), features)
    }

    pub(crate) fn share(&self) -> Arc<SessionInner> {
        Arc::clone(&self.inner)
    }
}

fn single(handle: OpHandle<GridPayload>) -> OpHandle<Grid> {
    handle.map(|res| res.and_then(GridPayload::into_single))
}

/// Canonicalize one query argument. Strings pass through raw; every other
/// scalar uses its wire form.
fn arg(name: &str, value: Scalar) -> (String, String) {
    let value = match value {
        Scalar::Str(s) => s,
        other => other.to_zinc(),
    };
    (name.to_string(), value)
}

fn id_grid(ids: &[&str]) -> Grid {
    let mut grid = Grid::new();
    grid.add_column("id");
    for id in ids {
        let mut row = Row::new();
        row.insert("id".to_string(), Scalar::make_ref(*id));
        grid.push_row(row);
    }
    grid
}

/// Builder for [`Session`]; validation happens in [`SessionBuilder::build`].
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    codec: Option<Arc<dyn GridCodec>>,
}

impl SessionBuilder {
    fn new(base_uri: impl Into<String>) -> Self {
        Self {
            config: SessionConfig {
                base_uri: base_uri.into(),
                ..SessionConfig::default()
            },
            transport: None,
            codec: None,
        }
    }

    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.config.auth_method = method;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    /// OAuth2 client credentials.
    pub fn client_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.config.client_id = client_id.into();
        self.config.client_secret = client_secret.into();
        self
    }

    /// OAuth2 token endpoint path, relative to the base URI.
    pub fn token_path(mut self, path: impl Into<String>) -> Self {
        self.config.token_path = path.into();
        self
    }

    /// Path prefix for API verbs. Empty means verbs live at the base URI.
    pub fn api_dir(mut self, api_dir: impl Into<String>) -> Self {
        self.config.api_dir = api_dir.into();
        self
    }

    pub fn format(mut self, format: GridFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn cache_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn strict_nonce(mut self, strict: bool) -> Self {
        self.config.strict_nonce = strict;
        self
    }

    /// Replace the HTTP transport (tests use an in-memory fake here).
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the grid codec, e.g. to add a ZINC implementation.
    pub fn codec(mut self, codec: Arc<dyn GridCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> Result<Session, ConfigError> {
        let mut config = self.config;
        let mut base = config.validate()?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        config.base_uri = base.to_string();

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(config.timeout)?,
        };
        let codec: Arc<dyn GridCodec> = match self.codec {
            Some(codec) => codec,
            None => Arc::new(JsonCodec),
        };

        Ok(Session {
            inner: Arc::new(SessionInner {
                config,
                base,
                transport,
                codec,
                auth: RwLock::new(None),
                auth_op: Mutex::new(None),
                grid_cache: Mutex::new(HashMap::new()),
                entities: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[cfg(feature = "reqwest-transport")]
fn default_transport(
    timeout: std::time::Duration,
) -> Result<Arc<dyn HttpTransport>, ConfigError> {
    crate::http::ReqwestTransport::new(timeout)
        .map(|t| Arc::new(t) as Arc<dyn HttpTransport>)
        .map_err(|_| ConfigError::NoTransport)
}

#[cfg(not(feature = "reqwest-transport"))]
fn default_transport(
    _timeout: std::time::Duration,
) -> Result<Arc<dyn HttpTransport>, ConfigError> {
    Err(ConfigError::NoTransport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_canonicalize_to_wire_form() {
        assert_eq!(
            arg("id", Scalar::make_ref("site1")),
            ("id".to_string(), "@site1".to_string())
        );
        // Filter strings travel raw, not quoted.
        assert_eq!(
            arg("filter", Scalar::str("site and area > 1000")),
            ("filter".to_string(), "site and area > 1000".to_string())
        );
        assert_eq!(
            arg("limit", Scalar::num(10.0)),
            ("limit".to_string(), "10".to_string())
        );
    }

    #[test]
    fn base_uri_gains_a_trailing_slash() {
        let session = Session::builder("http://demo.example/api")
            .api_dir("haystack")
            .transport(Arc::new(NullTransport))
            .build()
            .unwrap();
        assert_eq!(
            session.inner.resolve("haystack/read").unwrap(),
            "http://demo.example/api/haystack/read"
        );
    }

    #[test]
    fn id_grids_have_one_row_per_ref() {
        let grid = id_grid(&["a", "b"]);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.cell(1, "id"), Some(&Scalar::make_ref("b")));
    }

    struct NullTransport;

    #[async_trait::async_trait]
    impl HttpTransport for NullTransport {
        async fn roundtrip(
            &self,
            _request: HttpRequest,
        ) -> Result<HttpResponse, crate::core::TransportError> {
            Err(crate::core::TransportError::Connection {
                message: "null transport".to_string(),
            })
        }
    }
}
