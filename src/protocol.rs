//! HTTP protocol adapter — component C. Wraps an inbound request into the
//! opaque `F` closure the upstream worker runs, submits it to the balancer's
//! chosen server, and holds the upstream's raw response for the ingress
//! router to stream back. Ported from
//! `internal/platform/protocol/http.go`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use futures::TryStreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::{oneshot, Mutex};

use crate::balancer::Balancer;
use crate::error::AppError;
use crate::upstream::{RequestContext, UpstreamRequest, Work};

/// Per-location configuration: headers overlaid on every outbound request
/// (§4.C: "operator-configured headers overlay afterward").
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub pass_headers: HashMap<String, String>,
}

/// The upstream's raw response, held until the ingress layer streams it
/// back. Not buffered into `Bytes` up front — the spec's
/// "no request body buffering" non-goal extends to the response path too.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

/// HTTP pass-through handler bound to one location's balancer.
pub struct HttpAdapter {
    balancer: Arc<dyn Balancer>,
    options: HttpOptions,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(balancer: Arc<dyn Balancer>, options: HttpOptions) -> Self {
        Self {
            balancer,
            options,
            client: reqwest::Client::new(),
        }
    }

    /// Selects a server, enqueues a unit of work that performs the outbound
    /// call, and waits on `Done` (§4.C). `rewritten_path` is the path
    /// already rewritten by the ingress router's last-captured-group rule.
    pub async fn serve_request(
        &self,
        req: Request,
        rewritten_path: String,
        peer: String,
    ) -> Result<UpstreamResponse, AppError> {
        let server = self.balancer.next_server()?;

        let method = req.method().clone();
        let mut headers = req.headers().clone();
        let query = req.uri().query().map(|q| q.to_string());
        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        strip_single_value_only(&mut headers);
        overlay_pass_headers(&mut headers, &self.options.pass_headers);

        let body = Body::into_data_stream(req.into_body());
        let body_stream = body.map_err(std::io::Error::other);
        let reqwest_body = reqwest::Body::wrap_stream(body_stream);

        let client = self.client.clone();
        let slot: Arc<Mutex<Option<UpstreamResponse>>> = Arc::new(Mutex::new(None));
        let slot_for_work = slot.clone();

        let work: Work = Box::new(move |ctx: RequestContext| {
            Box::pin(async move {
                let resp = proxy_pass(
                    &client,
                    &ctx.uri,
                    method,
                    &rewritten_path,
                    query.as_deref(),
                    headers,
                    &host,
                    &peer,
                    reqwest_body,
                )
                .await?;

                if resp.status() == StatusCode::SERVICE_UNAVAILABLE {
                    return Err(AppError::UpstreamUnavailable);
                }

                let upstream_response = UpstreamResponse {
                    status: resp.status(),
                    headers: resp.headers().clone(),
                    body: reqwest::Body::wrap_stream(resp.bytes_stream()),
                };
                *slot_for_work.lock().await = Some(upstream_response);
                Ok(())
            })
        });

        let (done_tx, done_rx) = oneshot::channel();
        server.enqueue(UpstreamRequest { work, done: done_tx }).await?;

        match done_rx.await {
            Ok(Ok(())) => slot
                .lock()
                .await
                .take()
                .ok_or_else(|| AppError::Internal("worker completed with no response".to_string())),
            Ok(Err(e)) => Err(e),
            // The sender dropped without firing `Done`; treat as a transport
            // failure rather than hanging the caller forever.
            Err(_) => Err(AppError::UpstreamTransport("worker vanished".to_string())),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn proxy_pass(
    client: &reqwest::Client,
    uri: &str,
    method: Method,
    path: &str,
    query: Option<&str>,
    mut headers: HeaderMap,
    host: &str,
    peer: &str,
    body: reqwest::Body,
) -> Result<reqwest::Response, AppError> {
    let mut url = format!("http://{}{}", uri.trim_end_matches('/'), path);
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }

    headers.insert(
        http::header::CONNECTION,
        HeaderValue::from_static("Close"),
    );
    headers.insert(
        HeaderName::from_static("x-real-ip"),
        HeaderValue::from_str(peer).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(
        HeaderName::from_static("x-forwarded-host"),
        HeaderValue::from_str(host).unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| AppError::UpstreamTransport(e.to_string()))
}

/// Go's `wrapRequest` only forwards a header whose first value is
/// non-empty; axum/http's `HeaderMap` doesn't distinguish "present with an
/// empty value" the same way, so this drops any header whose sole value is
/// empty, matching the observable behavior.
fn strip_single_value_only(headers: &mut HeaderMap) {
    let retained: Vec<(HeaderName, HeaderValue)> = headers
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.clear();
    for (k, v) in retained {
        headers.append(k, v);
    }
}

fn overlay_pass_headers(headers: &mut HeaderMap, pass: &HashMap<String, String>) {
    for (k, v) in pass {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(k.as_str()),
            HeaderValue::from_str(v.as_str()),
        ) {
            headers.insert(name, value);
        }
    }
}
