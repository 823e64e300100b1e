//! HTTP route bridge
//!
//! Every plugin gets basic info/config routes under `/plugins/<id>` (and the
//! `/skServer/plugins/<id>` compatibility prefix). Plugins holding the
//! `httpEndpoints` capability additionally get one route per entry of their
//! `http_endpoints` export, dispatched to the named handler export.
//!
//! Handler calls cannot be interrupted once the module is running. The
//! [`HandlerDeadline`] only bounds how long the HTTP client waits: when it
//! expires the client gets a 504 and the module's eventual result is
//! dropped and counted.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, put};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::host::{PluginHost, PluginStatus, lock};
use crate::plugin_config::ConfigUpdate;
use crate::{PluginError, PluginResult};

/// Mount prefixes for plugin routes
pub const PLUGIN_PREFIXES: [&str; 2] = ["/plugins", "/skServer/plugins"];

/// Data model paths of the own vessel accept PUT requests here
pub const SELF_PUT_PREFIX: &str = "/signalk/v1/api/vessels/self";

const SUPPORTED_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// One entry of a module's `http_endpoints` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub method: String,
    pub path: String,
    pub handler: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Info,
    GetConfig,
    SaveConfig,
    Handler(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_segments(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Route {
    plugin_id: String,
    method: String,
    /// Path below the plugin prefix, as declared
    path: String,
    segments: Vec<Segment>,
    target: RouteTarget,
}

impl Route {
    fn new(plugin_id: &str, method: &str, path: &str, target: RouteTarget) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            segments: parse_segments(path),
            target,
        }
    }

    fn matches(&self, method: &str, rest: &[&str]) -> Option<BTreeMap<String, String>> {
        if !self.method.eq_ignore_ascii_case(method) || self.segments.len() != rest.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (segment, actual) in self.segments.iter().zip(rest) {
            match segment {
                Segment::Literal(expected) if expected == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*actual).to_string());
                }
            }
        }
        Some(params)
    }
}

/// A resolved request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub plugin_id: String,
    pub target: RouteTarget,
    /// Path below the plugin prefix
    pub path: String,
    pub params: BTreeMap<String, String>,
}

/// Routes of every registered plugin
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Info and config routes, mounted for enabled and disabled plugins alike
    pub fn mount_basic(&self, plugin_id: &str) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.push(Route::new(plugin_id, "GET", "/", RouteTarget::Info));
        routes.push(Route::new(plugin_id, "GET", "/config", RouteTarget::GetConfig));
        routes.push(Route::new(plugin_id, "POST", "/config", RouteTarget::SaveConfig));
        debug!(plugin_id, "mounted basic plugin routes");
    }

    /// Mount module-declared endpoints; returns how many were mounted
    pub fn mount_endpoints(&self, plugin_id: &str, endpoints: &[EndpointSpec]) -> usize {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let mut mounted = 0;
        for endpoint in endpoints {
            let method = endpoint.method.to_ascii_uppercase();
            if !SUPPORTED_METHODS.contains(&method.as_str()) {
                debug!(plugin_id, method = %endpoint.method, "skipping endpoint with unsupported method");
                continue;
            }
            routes.push(Route::new(
                plugin_id,
                &method,
                &endpoint.path,
                RouteTarget::Handler(endpoint.handler.clone()),
            ));
            mounted += 1;
        }
        info!(plugin_id, mounted, "mounted plugin HTTP endpoints");
        mounted
    }

    pub fn remove_plugin(&self, plugin_id: &str) -> usize {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|r| r.plugin_id != plugin_id);
        before - routes.len()
    }

    /// Find the route for a full request path such as `/plugins/<id>/config`
    pub fn resolve(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let rest = PLUGIN_PREFIXES.iter().find_map(|prefix| {
            let prefix: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();
            parts.starts_with(&prefix).then(|| &parts[prefix.len()..])
        })?;
        let (plugin_id, rest) = rest.split_first()?;

        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .filter(|r| r.plugin_id == *plugin_id)
            .find_map(|route| {
                route.matches(method, rest).map(|params| RouteMatch {
                    plugin_id: route.plugin_id.clone(),
                    target: route.target.clone(),
                    path: format!("/{}", rest.join("/")),
                    params,
                })
            })
    }

    /// Declared paths of one plugin, e.g. for listing
    pub fn paths_for(&self, plugin_id: &str) -> Vec<(String, String)> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.plugin_id == plugin_id)
            .map(|r| (r.method.clone(), r.path.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.routes.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Request context handed to a module's HTTP handler
#[derive(Debug, Clone, Serialize)]
pub struct PluginRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub body: Value,
    pub headers: BTreeMap<String, String>,
}

/// Response object a handler returns
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResponse {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: serde_json::Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Empty,
    Json(Value),
    Text(String),
}

/// What the host answers an HTTP request with
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ReplyBody,
}

impl HttpReply {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ReplyBody::Json(body),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": message.into() }))
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Translate a handler's response object
    pub fn from_plugin(response: PluginResponse) -> Self {
        let headers: Vec<(String, String)> = response
            .headers
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        let mut reply = Self {
            status: response.status_code.unwrap_or(200),
            headers,
            body: ReplyBody::Empty,
        };
        reply.body = match response.body {
            None | Some(Value::Null) => ReplyBody::Empty,
            Some(Value::String(text)) => {
                let is_json = reply
                    .header("content-type")
                    .is_some_and(|ct| ct.contains("application/json"));
                match is_json.then(|| serde_json::from_str::<Value>(&text)) {
                    Some(Ok(value)) => ReplyBody::Json(value),
                    Some(Err(e)) => {
                        debug!(error = %e, "JSON content type with unparsable body, sending as text");
                        ReplyBody::Text(text)
                    }
                    None => ReplyBody::Text(text),
                }
            }
            Some(value) => ReplyBody::Json(value),
        };
        reply
    }
}

impl IntoResponse for HttpReply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = match self.body {
            ReplyBody::Empty => status.into_response(),
            ReplyBody::Json(value) => (status, axum::Json(value)).into_response(),
            ReplyBody::Text(text) => (status, text).into_response(),
        };
        for (name, value) in self.headers {
            match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => debug!(header = %name, "dropping invalid plugin response header"),
            }
        }
        response
    }
}

/// Client-facing deadline for module HTTP handlers
#[derive(Debug, Clone)]
pub struct HandlerDeadline {
    timeout: Duration,
    late: Arc<AtomicU64>,
}

impl HandlerDeadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            late: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Results that arrived after their deadline
    pub fn late_count(&self) -> Arc<AtomicU64> {
        self.late.clone()
    }

    /// Run a blocking module call, giving up on waiting after the deadline.
    /// The call itself keeps running to completion.
    pub async fn run<T, F>(&self, call: F) -> PluginResult<T>
    where
        F: FnOnce() -> PluginResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let late = self.late.clone();
        tokio::task::spawn_blocking(move || {
            if tx.send(call()).is_err() {
                late.fetch_add(1, Ordering::Relaxed);
                debug!("handler finished after its deadline, result discarded");
            }
        });
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PluginError::Crashed("handler ended without a result".to_string())),
            Err(_) => Err(PluginError::HandlerTimeout(self.timeout.as_millis() as u64)),
        }
    }
}

impl PluginHost {
    /// (Re)mount a plugin's routes: basic ones always, declared endpoints
    /// when the plugin is loaded and holds `httpEndpoints`
    pub(crate) fn install_routes(&self, plugin_id: &str) {
        let routes = &self.inner.routes;
        routes.remove_plugin(plugin_id);
        routes.mount_basic(plugin_id);

        let Some(record) = self.inner.services.plugins.get(plugin_id) else {
            return;
        };
        let (instance, allowed) = {
            let plugin = lock(&record);
            (plugin.instance.clone(), plugin.capabilities.http_endpoints)
        };
        match instance {
            Some(instance) if allowed => {
                routes.mount_endpoints(plugin_id, instance.endpoints());
            }
            Some(instance) if !instance.endpoints().is_empty() => {
                warn!(plugin_id, "plugin declares HTTP endpoints without httpEndpoints capability, not mounted");
            }
            _ => {}
        }
        debug!(plugin_id, routes = ?routes.paths_for(plugin_id), "plugin routes installed");
    }

    /// Answer one HTTP request addressed to a plugin
    pub async fn handle_http(
        &self,
        method: &str,
        path: &str,
        query: BTreeMap<String, String>,
        headers: BTreeMap<String, String>,
        body: Value,
    ) -> HttpReply {
        let Some(route) = self.inner.routes.resolve(method, path) else {
            return HttpReply::error(404, "Not found");
        };
        let plugin_id = route.plugin_id.as_str();
        match &route.target {
            RouteTarget::Info => match self.plugin_info(plugin_id) {
                Ok(info) => HttpReply::json(200, info),
                Err(e) => HttpReply::error(404, e.to_string()),
            },
            RouteTarget::GetConfig => match self.get_config(plugin_id) {
                Ok(config) => HttpReply::json(200, config),
                Err(e) => HttpReply::error(500, e.to_string()),
            },
            RouteTarget::SaveConfig => {
                let update = match serde_json::from_value::<ConfigUpdate>(body) {
                    Ok(update) => update,
                    Err(e) => return HttpReply::error(400, format!("Invalid configuration body: {e}")),
                };
                match self.update_config(plugin_id, update).await {
                    Ok(message) => HttpReply::json(200, Value::String(message)),
                    Err(e) => HttpReply::error(500, e.to_string()),
                }
            }
            RouteTarget::Handler(handler) => {
                let request = PluginRequest {
                    method: method.to_ascii_uppercase(),
                    path: route.path.clone(),
                    query,
                    params: route.params.clone(),
                    body,
                    headers,
                };
                self.call_endpoint(plugin_id, handler, &request).await
            }
        }
    }

    async fn call_endpoint(&self, plugin_id: &str, handler: &str, request: &PluginRequest) -> HttpReply {
        let instance = self.inner.services.plugins.get(plugin_id).and_then(|record| {
            let plugin = lock(&record);
            (plugin.status == PluginStatus::Running)
                .then(|| plugin.instance.clone())
                .flatten()
        });
        let Some(instance) = instance else {
            return HttpReply::error(503, "Plugin not running");
        };
        let ctx = match serde_json::to_string(request) {
            Ok(ctx) => ctx,
            Err(e) => return HttpReply::error(500, e.to_string()),
        };
        debug!(plugin_id, handler, method = %request.method, path = %request.path, "calling plugin handler");

        let handler_name = handler.to_string();
        let outcome = self
            .inner
            .deadline
            .run(move || instance.call_http_handler(&handler_name, &ctx))
            .await;

        match outcome {
            Ok(text) => match serde_json::from_str::<PluginResponse>(&text) {
                Ok(response) => HttpReply::from_plugin(response),
                Err(e) => {
                    warn!(plugin_id, handler, error = %e, "handler returned invalid response JSON");
                    HttpReply::error(500, format!("Invalid handler response: {e}"))
                }
            },
            Err(PluginError::HandlerTimeout(ms)) => {
                warn!(plugin_id, handler, timeout_ms = ms, "plugin handler timed out, answering 504");
                HttpReply::json(
                    504,
                    json!({
                        "error": "Plugin handler timeout",
                        "message": "The plugin took too long to respond; its handler is still running.",
                    }),
                )
            }
            Err(e) => {
                warn!(plugin_id, handler, error = %e, "plugin handler failed");
                HttpReply::error(500, e.to_string())
            }
        }
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

fn request_body(bytes: &Bytes) -> Value {
    if bytes.is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

async fn dispatch(
    State(host): State<PluginHost>,
    method: Method,
    uri: Uri,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpReply {
    host.handle_http(
        method.as_str(),
        uri.path(),
        query,
        header_map(&headers),
        request_body(&body),
    )
    .await
}

/// URL segments to a dotted data model path
fn data_path(rest: &str) -> String {
    rest.split('/').filter(|segment| !segment.is_empty()).collect::<Vec<_>>().join(".")
}

/// `PUT /signalk/v1/api/vessels/self/<a>/<b>` with `{"value": ..}` goes
/// to whichever plugin claimed `vessels.self` / `a.b`
async fn self_put(State(host): State<PluginHost>, Path(rest): Path<String>, body: Bytes) -> HttpReply {
    let body = request_body(&body);
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    let result = host.handle_put("vessels.self", &data_path(&rest), &value).await;
    HttpReply::json(crate::put::status_code(&result), result)
}

/// Axum router serving plugin routes, PUT requests and webapp assets
pub fn router(host: PluginHost) -> Router {
    let mut router = Router::new().route(&format!("{SELF_PUT_PREFIX}/{{*path}}"), put(self_put));
    for prefix in PLUGIN_PREFIXES {
        router = router.route(&format!("{prefix}/{{*rest}}"), any(dispatch));
    }
    for webapp in host.webapps() {
        if webapp.dir.is_dir() {
            info!(path = %webapp.url_path(), dir = %webapp.dir.display(), "webapp mounted");
            router = router.nest_service(&webapp.url_path(), ServeDir::new(&webapp.dir));
        } else {
            warn!(package = %webapp.package_name, "webapp directory missing, skipping");
        }
    }
    router.with_state(host)
}
