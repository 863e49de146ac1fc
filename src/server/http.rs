//! HTTP server implementation
//!
//! hyper http1 with TokioIo for async handling. Each connection gets a
//! spawned task; each request gets a fresh engine context whose session
//! is released on every exit path. Engine panics are captured here,
//! logged, and rendered as statusCode 500.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::io::Write;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use url::Url;

use crate::codec::record_to_map;
use crate::context::Context;
use crate::engine::{Engine, Method};
use crate::handler::{Binary, Outcome};
use crate::resid::ResId;
use crate::server::util::{etag, random_id};
use crate::types::{Error, ErrorKind};
use crate::util::parse_param_bool;
use crate::value::Record;

const ID_COOKIE: &str = "MOGOGO_ID";
const TS_COOKIE: &str = "MOGOGO_TS";
const COOKIE_REFRESH_HOURS: i64 = 24;
const COOKIE_LIFETIME_DAYS: i64 = 365;

/// Persistence hook for the context bag across requests, keyed by the
/// identity cookie.
#[async_trait::async_trait]
pub trait ContextStore: Send + Sync {
    async fn load(&self, ctx_id: &str, ctx: &mut Context);
    async fn store(&self, ctx_id: &str, ctx: &Context);
}

/// Transport configuration.
#[derive(Clone)]
pub struct HttpConfig {
    pub listen: SocketAddr,
    /// Prefetch map: resource or shape name → recursive expansion
    /// config (`$n`, `$all`, `$noitems`, `$norels`, `$hidden` flags).
    pub prefetch: JsonMap<String, JsonValue>,
    pub context_store: Option<Arc<dyn ContextStore>>,
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("LISTEN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("default listen addr"));
        HttpConfig { listen, prefetch: JsonMap::new(), context_store: None }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Shared server state.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: HttpConfig,
}

/// Start the HTTP server.
pub async fn run(state: Arc<AppState>) -> crate::types::Result<()> {
    let listener = TcpListener::bind(state.config.listen)
        .await
        .map_err(Error::internal)?;
    info!("resource engine listening on {}", state.config.listen);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("error accepting connection: {:?}", e);
            }
        }
    }
}

enum Payload {
    Json(u16, JsonValue),
    Binary(Bytes, String),
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    debug!("[{}] {} {}", addr, method, path_and_query);

    let host = parts
        .headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("http");
    let base: Url = match format!("{}://{}/", scheme, host).parse() {
        Ok(u) => u,
        Err(_) => "http://localhost/".parse().expect("fallback base url"),
    };

    let body_bytes = body.collect().await?.to_bytes();

    let served = std::panic::AssertUnwindSafe(serve(
        &state,
        &parts,
        &path_and_query,
        body_bytes,
        &base,
    ))
    .catch_unwind()
    .await;

    let (payload, new_ctx_id) = match served {
        Ok(done) => done,
        Err(panic) => {
            let msg = panic_message(&panic);
            error!("panic serving {} {}: {}", method, path_and_query, msg);
            let body = serde_json::json!({
                "statusCode": 500,
                "statusMsg": "internal server error",
            });
            (Payload::Json(500, body), None)
        }
    };

    Ok(render(&state, &parts, payload, new_ctx_id))
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one external request through the engine, managing the context
/// lifecycle and bag persistence.
async fn serve(
    state: &AppState,
    parts: &hyper::http::request::Parts,
    path_and_query: &str,
    body: Bytes,
    base: &Url,
) -> (Payload, Option<String>) {
    let mut ctx = state.engine.new_context();

    let ctx_id = cookie_value(parts, ID_COOKIE);
    if let (Some(store), Some(id)) = (&state.config.context_store, &ctx_id) {
        store.load(id, &mut ctx).await;
    }
    ctx.set_updated(false);

    let method = match Method::parse(parts.method.as_str()) {
        Some(m) => m,
        None => {
            if ctx.is_open() {
                ctx.close();
            }
            return (
                Payload::Json(405, error_map(&Error::method_not_allowed())),
                None,
            );
        }
    };
    let content_type = parts
        .headers
        .get("content-type")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let payload = request_once(
        state,
        &mut ctx,
        method,
        path_and_query.to_string(),
        content_type,
        Some(body),
        None,
        true,
        base,
    )
    .await;

    // Persist the bag when a handler changed it; mint an identity for
    // first-time visitors.
    let mut new_ctx_id = None;
    if let Some(store) = &state.config.context_store {
        if ctx.is_updated() {
            let id = match &ctx_id {
                Some(id) => id.clone(),
                None => {
                    let id = random_id();
                    new_ctx_id = Some(id.clone());
                    id
                }
            };
            store.store(&id, &ctx).await;
        }
    }
    if ctx.is_open() {
        ctx.close();
    }
    (payload, new_ctx_id)
}

/// One engine round-trip: parse, dispatch, render the outcome. Used for
/// both the external request and internal prefetch expansion.
#[allow(clippy::too_many_arguments)]
fn request_once<'a>(
    state: &'a AppState,
    ctx: &'a mut Context,
    method: Method,
    url: String,
    content_type: Option<String>,
    body: Option<Bytes>,
    cfg: Option<JsonMap<String, JsonValue>>,
    start: bool,
    base: &'a Url,
) -> BoxFuture<'a, Payload> {
    async move {
        let res_id = match ResId::parse(&url) {
            Ok(id) => id,
            Err(e) => return Payload::Json(e.status(), error_map(&e)),
        };
        let mut handle = match state.engine.resource(res_id, ctx) {
            Ok(h) => h,
            Err(e) => return Payload::Json(e.status(), error_map(&e)),
        };

        // Resolve the prefetch config by resource name, falling back to
        // the response shape name.
        let cfg = if start {
            let by_name = state.config.prefetch.get(handle.id().name());
            let by_type = state.config.prefetch.get(handle.response_type());
            by_name
                .or(by_type)
                .and_then(|v| v.as_object())
                .cloned()
        } else {
            cfg
        };
        params_from_config(&mut handle, cfg.as_ref());
        // The outer request shows relation links unless the `norels`
        // parameter suppresses them. Prefetch-expanded records suppress
        // them unless the field's config says `$norels: false`.
        let norels = if start {
            parse_param_bool(&handle.id().params, "norels", false).unwrap_or(false)
        } else {
            cfg.as_ref()
                .and_then(|c| c.get("$norels"))
                .map(flag_bool)
                .unwrap_or(true)
        };

        let outcome = match method {
            Method::Get => handle.get(ctx).await,
            Method::Delete => handle.delete(ctx).await,
            Method::Post | Method::Put | Method::Patch => {
                let body = body.unwrap_or_default();
                if handle.can_binary() && method == Method::Post {
                    let bin =
                        Binary::from_payload(body, content_type.unwrap_or_default());
                    handle.post_binary(bin, ctx).await
                } else if content_type.as_deref().map_or(false, is_json) {
                    let map: JsonMap<String, JsonValue> =
                        match serde_json::from_slice::<JsonValue>(&body)
                            .ok()
                            .and_then(|v| v.as_object().cloned())
                        {
                            Some(m) => m,
                            None => {
                                let e = Error::bad_request("request body is not a JSON object");
                                return Payload::Json(e.status(), error_map(&e));
                            }
                        };
                    let result = if method == Method::Patch {
                        match handle.map_to_updater(&map, base) {
                            Ok(u) => handle.patch(u, ctx).await,
                            Err(e) => Err(e),
                        }
                    } else {
                        match handle.map_to_request(&map, base) {
                            Ok(r) => match method {
                                Method::Post => handle.post(r, ctx).await,
                                _ => handle.put(r, ctx).await,
                            },
                            Err(e) => Err(e),
                        }
                    };
                    result
                } else {
                    Err(Error::new(ErrorKind::UnsupportedMediaType))
                }
            }
        };

        match outcome {
            Ok(Outcome::Record(rec)) => {
                let status = if rec.base.is_new { 201 } else { 200 };
                let mut map = record_map(state, ctx, &rec, cfg.as_ref(), norels, base).await;
                map.insert("statusCode".to_string(), JsonValue::from(status));
                Payload::Json(status, JsonValue::Object(map))
            }
            Ok(Outcome::Iter(mut iter)) => {
                match iter.slice(&state.engine, ctx).await {
                    Ok(slice) => {
                        let mut status: u16 = 200;
                        let mut map = JsonMap::new();
                        map.insert(
                            "self".to_string(),
                            JsonValue::String(slice.self_id.url_with_base(base).to_string()),
                        );
                        if let Some(prev) = &slice.prev {
                            map.insert(
                                "prev".to_string(),
                                JsonValue::String(prev.url_with_base(base).to_string()),
                            );
                        }
                        if let Some(next) = &slice.next {
                            map.insert(
                                "next".to_string(),
                                JsonValue::String(next.url_with_base(base).to_string()),
                            );
                        }
                        if let Some(count) = slice.count {
                            map.insert("count".to_string(), JsonValue::from(count));
                            map.insert("more".to_string(), JsonValue::Bool(slice.more));
                        }
                        if let Some(items) = &slice.items {
                            let mut out = Vec::with_capacity(items.len());
                            for rec in items {
                                let m =
                                    record_map(state, ctx, rec, cfg.as_ref(), norels, base)
                                        .await;
                                out.push(JsonValue::Object(m));
                            }
                            if out.is_empty() {
                                status = 404;
                            }
                            map.insert("slice".to_string(), JsonValue::Array(out));
                        }
                        map.insert("statusCode".to_string(), JsonValue::from(status));
                        Payload::Json(status, JsonValue::Object(map))
                    }
                    Err(e) => Payload::Json(e.status(), error_map(&e)),
                }
            }
            Ok(Outcome::Binary(bin)) => match (bin.data, bin.location) {
                (Some(data), _) => {
                    Payload::Binary(data, bin.media_type.unwrap_or_default())
                }
                (None, Some(location)) => {
                    let body = serde_json::json!({
                        "statusCode": 201,
                        "self": location.url_with_base(base).to_string(),
                    });
                    Payload::Json(201, body)
                }
                (None, None) => Payload::Json(200, serde_json::json!({"statusCode": 200})),
            },
            Ok(Outcome::None) => Payload::Json(200, serde_json::json!({"statusCode": 200})),
            Err(e) => Payload::Json(e.status(), error_map(&e)),
        }
    }
    .boxed()
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|s| s.trim() == "application/json")
        .unwrap_or(false)
}

fn error_map(err: &Error) -> JsonValue {
    let mut map = JsonMap::new();
    map.insert("statusCode".to_string(), JsonValue::from(err.status()));
    map.insert("statusMsg".to_string(), JsonValue::String(err.to_string()));
    if let Some(fields) = &err.fields {
        map.insert(
            "fields".to_string(),
            JsonValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                    .collect(),
            ),
        );
    }
    JsonValue::Object(map)
}

fn flag_bool(v: &JsonValue) -> bool {
    match v {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn cfg_flag(cfg: Option<&JsonMap<String, JsonValue>>, key: &str) -> bool {
    cfg.and_then(|c| c.get(key)).map(flag_bool).unwrap_or(false)
}

/// Render a record with its relation links, then expand prefetch
/// fields.
async fn record_map(
    state: &AppState,
    ctx: &mut Context,
    rec: &Record,
    cfg: Option<&JsonMap<String, JsonValue>>,
    norels: bool,
    base: &Url,
) -> JsonMap<String, JsonValue> {
    let shape = state.engine.shape(rec.type_name()).clone();
    let mut map = record_to_map(&shape, rec, base);
    if !norels {
        for (name, rel) in state.engine.all_rels(rec) {
            map.insert(
                name.to_lowercase(),
                serde_json::json!({"href": rel.url_with_base(base).to_string()}),
            );
        }
    }
    if let Some(cfg) = cfg {
        prefetch(state, ctx, &mut map, cfg, base).await;
    }
    map
}

/// Expand configured fields inline by following their `href` with an
/// internal GET. `$hidden` drops the field instead.
async fn prefetch(
    state: &AppState,
    ctx: &mut Context,
    map: &mut JsonMap<String, JsonValue>,
    cfg: &JsonMap<String, JsonValue>,
    base: &Url,
) {
    for (field, field_cfg) in cfg {
        if field.starts_with('$') {
            continue;
        }
        if !map.contains_key(field) {
            continue;
        }
        let field_cfg_map = field_cfg.as_object();
        if cfg_flag(field_cfg_map, "$hidden") {
            map.remove(field);
            continue;
        }
        let href = map
            .get(field)
            .and_then(|v| v.as_object())
            .and_then(|o| o.get("href"))
            .and_then(|h| h.as_str())
            .map(|s| s.to_string());
        let Some(href) = href else { continue };
        let fetched = request_once(
            state,
            ctx,
            Method::Get,
            href.clone(),
            None,
            None,
            field_cfg_map.cloned(),
            false,
            base,
        )
        .await;
        match fetched {
            Payload::Json(status, JsonValue::Object(mut m)) if status < 500 => {
                m.insert("href".to_string(), JsonValue::String(href));
                map.insert(field.clone(), JsonValue::Object(m));
            }
            Payload::Json(_, body) => {
                panic!(
                    "prefetch of '{}' failed: {}",
                    field,
                    body.get("statusMsg").and_then(|m| m.as_str()).unwrap_or("?")
                );
            }
            Payload::Binary(..) => panic!("prefetch of '{}' returned binary", field),
        }
    }
}

/// Apply pagination flags from a prefetch config to the identifier.
fn params_from_config(
    handle: &mut crate::dispatch::ResourceHandle<'_>,
    cfg: Option<&JsonMap<String, JsonValue>>,
) {
    let Some(cfg) = cfg else { return };
    let params = handle.params_mut();
    if let Some(n) = cfg.get("$n") {
        params.insert("n".to_string(), flag_string(n));
    } else if let Some(all) = cfg.get("$all") {
        params.insert("all".to_string(), flag_string(all));
    } else if let Some(noitems) = cfg.get("$noitems") {
        params.insert("noitems".to_string(), flag_string(noitems));
    }
}

fn flag_string(v: &JsonValue) -> String {
    match v {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// response rendering: ETag, compression, cookies
// ---------------------------------------------------------------------------

fn render(
    state: &AppState,
    parts: &hyper::http::request::Parts,
    payload: Payload,
    new_ctx_id: Option<String>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder();

    for cookie in cookie_headers(parts, new_ctx_id, state.config.context_store.is_some()) {
        builder = builder.header("Set-Cookie", cookie);
    }

    match payload {
        Payload::Binary(data, media_type) => builder
            .status(StatusCode::OK)
            .header("Content-Type", media_type)
            .body(Full::new(data))
            .expect("binary response"),
        Payload::Json(status, body) => {
            let status = StatusCode::from_u16(status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let json = serde_json::to_vec(&body).unwrap_or_else(|e| {
                error!("response serialization failed: {}", e);
                br#"{"statusCode":500,"statusMsg":"internal server error"}"#.to_vec()
            });
            let tag = etag(&json);
            let if_none_match = parts
                .headers
                .get("if-none-match")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim_matches('"').to_string());
            if if_none_match.as_deref() == Some(tag.as_str()) {
                return builder
                    .status(StatusCode::NOT_MODIFIED)
                    .header("ETag", format!("\"{}\"", tag))
                    .body(Full::new(Bytes::new()))
                    .expect("not-modified response");
            }

            let accept_encoding = parts
                .headers
                .get("accept-encoding")
                .and_then(|h| h.to_str().ok())
                .unwrap_or("");
            let (bytes, encoding) = compress(json, accept_encoding);
            let mut builder = builder
                .status(status)
                .header("Content-Type", "application/json")
                .header("ETag", format!("\"{}\"", tag));
            if let Some(enc) = encoding {
                builder = builder.header("Content-Encoding", enc);
            }
            builder.body(Full::new(Bytes::from(bytes))).expect("json response")
        }
    }
}

fn compress(body: Vec<u8>, accept_encoding: &str) -> (Vec<u8>, Option<&'static str>) {
    if accept_encoding.contains("gzip") {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        if enc.write_all(&body).is_ok() {
            if let Ok(out) = enc.finish() {
                return (out, Some("gzip"));
            }
        }
        (body, None)
    } else if accept_encoding.contains("deflate") {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        if enc.write_all(&body).is_ok() {
            if let Ok(out) = enc.finish() {
                return (out, Some("deflate"));
            }
        }
        (body, None)
    } else {
        (body, None)
    }
}

fn cookie_value(parts: &hyper::http::request::Parts, name: &str) -> Option<String> {
    let header = parts.headers.get("cookie")?.to_str().ok()?;
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some((k, v)) = pair.split_once('=') {
            if k == name {
                return Some(v.to_string());
            }
        }
    }
    None
}

fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Identity and time-stamp cookies: mint on first store, refresh when
/// the stamp is older than a day, cap the lifetime at a year.
fn cookie_headers(
    parts: &hyper::http::request::Parts,
    new_ctx_id: Option<String>,
    store_enabled: bool,
) -> Vec<String> {
    if !store_enabled {
        return Vec::new();
    }
    let now = Utc::now();
    let expires = http_date(now + ChronoDuration::days(COOKIE_LIFETIME_DAYS));
    let ts = crate::server::util::base36(now.timestamp() as u64);

    if let Some(id) = new_ctx_id {
        return vec![
            format!("{}={}; Path=/; Expires={}", ID_COOKIE, id, expires),
            format!("{}={}; Path=/; Expires={}", TS_COOKIE, ts, expires),
        ];
    }

    let Some(id) = cookie_value(parts, ID_COOKIE) else {
        return Vec::new();
    };
    let stamped = cookie_value(parts, TS_COOKIE)
        .and_then(|v| crate::server::util::parse_base36(&v))
        .map(|secs| {
            DateTime::<Utc>::from_timestamp(secs as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
        })
        .unwrap_or(DateTime::UNIX_EPOCH);
    if now - stamped > ChronoDuration::hours(COOKIE_REFRESH_HOURS) {
        vec![
            format!("{}={}; Path=/; Expires={}", ID_COOKIE, id, expires),
            format!("{}={}; Path=/; Expires={}", TS_COOKIE, ts, expires),
        ]
    } else {
        Vec::new()
    }
}
