//! Crate-wide error taxonomy, modeled on `internal/errors.HTTPError` in the
//! original `gourmet` source: every error the ingress router ever renders to
//! a client carries a numeric status, its canonical text, and a free-form
//! description.

use serde::Serialize;
use thiserror::Error;

/// Errors produced anywhere in the upstream pipeline (balancer, worker,
/// protocol adapter). Each variant maps to exactly one HTTP status via
/// [`AppError::status`].
#[derive(Debug, Error, Clone)]
pub enum AppError {
    /// No available server could be found within the balancer's selection
    /// budget (§4.B, §7: `PoolExhausted`).
    #[error("all upstream servers are in an unhealthy state")]
    PoolExhausted,

    /// The outbound HTTP call to the chosen server failed at the transport
    /// level (connect refused, DNS failure, broken pipe, deadline exceeded).
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// The upstream server answered with a 503.
    #[error("upstream server unavailable")]
    UpstreamUnavailable,

    /// No configured [`Location`](crate::ingress::Location) matched the
    /// inbound path.
    #[error("no matching route")]
    RouteNotFound,

    /// `F` panicked while running inside an [`UpstreamServer`](crate::upstream::UpstreamServer)
    /// worker. The panic was caught; the worker keeps running.
    #[error("terminated due to system panic")]
    PanicInWorker,

    /// Anything else, surfaced to the client as a 500.
    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> u16 {
        match self {
            AppError::PoolExhausted => 503,
            AppError::UpstreamTransport(_) => 502,
            AppError::UpstreamUnavailable => 503,
            AppError::RouteNotFound => 404,
            AppError::PanicInWorker => 502,
            AppError::Internal(_) => 500,
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self.status() {
            404 => "Not Found",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }

    /// Converts this error into the wire-level shape clients see, carrying
    /// the inbound path or upstream error text in `description` per §7.
    pub fn into_http_error(self, description: impl Into<String>) -> HttpError {
        HttpError {
            status: self.status(),
            status_text: self.status_text().to_string(),
            description: description.into(),
        }
    }
}

/// The client-visible error body, rendered as JSON or as the HTML error
/// template by the ingress router. Field names mirror
/// `internal/errors.HTTPError` exactly so the JSON shape matches §7.
#[derive(Debug, Clone, Serialize)]
pub struct HttpError {
    pub status: u16,
    pub status_text: String,
    pub description: String,
}

impl HttpError {
    pub fn not_found(path: &str) -> Self {
        AppError::RouteNotFound.into_http_error(format!(
            "the path {path} could not be found on the server."
        ))
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} <{}>", self.status, self.status_text, self.description)
    }
}
