//! Ingress router — component D. Matches inbound paths against an ordered
//! list of regex locations, rewrites the path to the last captured group,
//! and renders classified errors as HTML or JSON. Ported from
//! `internal/platform/ingress/{ingress,tpl}.go`.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use http::{HeaderValue, StatusCode};
use regex::Regex;
use tracing::info;

use crate::access_log::{AccessLog, AccessLogEntry};
use crate::error::{AppError, HttpError};
use crate::protocol::HttpAdapter;

const ERROR_TEMPLATE: &str = include_str!("error_template.html");

/// One registered route: a compiled pattern and the adapter it forwards to.
/// Order is significant — first match wins (§4.D).
pub struct Location {
    pattern: Regex,
    adapter: HttpAdapter,
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Location")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl Location {
    pub fn new(pattern: Regex, adapter: HttpAdapter) -> Self {
        Self { pattern, adapter }
    }

    /// Returns the rewritten path (the last captured group, per Go's
    /// `m[len(m)-1]`) if `target` matches.
    fn rewrite(&self, target: &str) -> Option<String> {
        let caps = self.pattern.captures(target)?;
        let last = caps.iter().flatten().last()?;
        Some(format!("/{}", last.as_str()))
    }
}

pub struct Ingress {
    locations: Vec<Location>,
    access_log: Option<Arc<AccessLog>>,
}

impl std::fmt::Debug for Ingress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingress")
            .field("locations", &self.locations)
            .finish_non_exhaustive()
    }
}

impl Ingress {
    pub fn new(locations: Vec<Location>, access_log: Option<Arc<AccessLog>>) -> Self {
        Self {
            locations,
            access_log,
        }
    }

    fn r#match(&self, host: &str, path: &str) -> Option<(usize, String)> {
        let target = format!("{host}{path}");
        self.locations
            .iter()
            .enumerate()
            .find_map(|(i, loc)| loc.rewrite(&target).map(|rewritten| (i, rewritten)))
    }

    pub async fn serve(self: Arc<Self>, peer: String, req: Request) -> Response {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let wants_json = wants_json(&req);

        info!(%method, %path, %peer, "inbound request");

        let (idx, rewritten) = match self.r#match(&host, &path) {
            Some(m) => m,
            None => {
                let resp = render_no_route_error(&path, wants_json);
                self.log(&method, &path, &peer, None, resp.status(), start)
                    .await;
                return resp;
            }
        };
        let adapter = &self.locations[idx].adapter;

        match adapter.serve_request(req, rewritten, peer.clone()).await {
            Ok(upstream) => {
                let status = upstream.status;
                let mut response = Response::builder().status(status);
                if let Some(headers) = response.headers_mut() {
                    for (name, value) in upstream.headers.iter() {
                        if !is_hop_by_hop(name.as_str()) {
                            headers.insert(name.clone(), value.clone());
                        }
                    }
                }
                let body = Body::new(upstream.body);
                let resp = response.body(body).unwrap_or_else(|_| {
                    render_error(
                        AppError::Internal("failed to build response".into())
                            .into_http_error("response assembly failed"),
                        wants_json,
                    )
                });
                self.log(&method, &path, &peer, Some(idx), status, start).await;
                resp
            }
            Err(e) => {
                let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let http_err = e.clone().into_http_error(e.to_string());
                let resp = render_error(http_err, wants_json);
                self.log(&method, &path, &peer, Some(idx), status, start).await;
                resp
            }
        }
    }

    async fn log(
        &self,
        method: &http::Method,
        path: &str,
        peer: &str,
        upstream_idx: Option<usize>,
        status: StatusCode,
        start: Instant,
    ) {
        if let Some(log) = &self.access_log {
            log.record(AccessLogEntry {
                method: method.to_string(),
                path: path.to_string(),
                peer: peer.to_string(),
                upstream: upstream_idx.map(|i| i.to_string()),
                status: status.as_u16(),
                duration: start.elapsed(),
                timestamp: chrono::Utc::now(),
            })
            .await;
        }
    }
}

pub async fn handler(
    State(ingress): State<Arc<Ingress>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    req: Request,
) -> Response {
    ingress.serve(addr.to_string(), req).await
}

fn wants_json(req: &Request) -> bool {
    req.headers()
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        == Some("application/json")
}

fn render_error(err: HttpError, as_json: bool) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if as_json {
        let body = serde_json::to_vec(&err).unwrap_or_else(|_| br#"{"error":"not found"}"#.to_vec());
        let mut resp = Response::new(Body::from(body));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp
    } else {
        let html = ERROR_TEMPLATE
            .replace("{{status}}", &err.status.to_string())
            .replace("{{status_text}}", &err.status_text)
            .replace("{{description}}", &err.description);
        let mut resp = Response::new(Body::from(html));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html"),
        );
        resp
    }
}

/// Renders the no-matching-route case. `writeRouteErr` in the Go source
/// writes the literal `{"error":"not found"}` for JSON clients — distinct
/// from `writerJSONErr`'s `{status,status_text,description}` shape used for
/// classified adapter errors — and the HTML error template otherwise.
fn render_no_route_error(path: &str, as_json: bool) -> Response {
    if as_json {
        let mut resp = Response::new(Body::from(r#"{"error":"not found"}"#));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp
    } else {
        render_error(HttpError::not_found(path), false)
    }
}

/// Headers that are connection-scoped and must never be copied verbatim
/// from an upstream response to the client.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailer" | "transfer-encoding" | "upgrade"
    )
}
