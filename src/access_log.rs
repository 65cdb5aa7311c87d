//! Append-only access log — component F. Not part of the original Go
//! source; grounded on `exec-rustweb`'s `AccessLogger`/`LogEntry`, adapted
//! to gourmet's request shape (no request IDs or user-agent capture, since
//! nothing upstream of this module produces them; `timestamp` is kept,
//! since it's intrinsic to any access log entry).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub method: String,
    pub path: String,
    pub peer: String,
    /// Index of the matched location, as a string, or `None` if no route
    /// matched (the 404 case never reaches an upstream).
    pub upstream: Option<String>,
    pub status: u16,
    pub duration: Duration,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Appends one JSON line per inbound request to the file opened at
/// construction. Never blocks the response path longer than a mutex
/// acquisition; write failures are logged and otherwise swallowed (§4.F).
pub struct AccessLog {
    file: Mutex<tokio::fs::File>,
}

impl AccessLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub async fn record(&self, entry: AccessLogEntry) {
        let line = json!({
            "timestamp": entry.timestamp.to_rfc3339(),
            "method": entry.method,
            "path": entry.path,
            "peer": entry.peer,
            "upstream": entry.upstream,
            "status": entry.status,
            "duration_ms": entry.duration.as_secs_f64() * 1000.0,
        })
        .to_string();

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(error = %e, "failed to write access log entry");
            return;
        }
        if let Err(e) = file.write_all(b"\n").await {
            error!(error = %e, "failed to write access log entry");
        }
    }
}

/// Convenience wrapper so callers can pass `Option<Arc<AccessLog>>` around
/// without constantly re-deriving the `Arc`.
pub async fn open_shared(path: &Path) -> std::io::Result<Arc<AccessLog>> {
    Ok(Arc::new(AccessLog::open(path).await?))
}
