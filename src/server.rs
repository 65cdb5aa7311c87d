//! Process bootstrap — component G. Binds the listening socket, serves the
//! ingress router, and on SIGINT/SIGTERM signals every upstream worker's
//! stop channel before exiting. Ported from the teacher's
//! `WraithServer`/`shutdown_signal`, stripped of the admin dashboard and
//! static file surfaces that have no counterpart here.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use axum::Router;
use tokio::signal;
use tracing::info;

use crate::access_log;
use crate::compose::{self, Composed};
use crate::config::Config;
use crate::ingress;

pub struct GourmetServer {
    composed: Composed,
    port: u16,
}

impl GourmetServer {
    pub async fn new(config: Config, log_path: Option<&Path>) -> Result<Self> {
        let access_log = match log_path {
            Some(path) => Some(
                access_log::open_shared(path)
                    .await
                    .with_context(|| format!("failed to open access log at {}", path.display()))?,
            ),
            None => None,
        };

        let port = config.server.port;
        let composed =
            compose::from_config(&config, access_log).context("failed to compose upstream pool")?;

        Ok(Self { composed, port })
    }

    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let app = Router::new()
            .fallback(ingress::handler)
            .with_state(self.composed.ingress.clone());

        info!(%addr, "gourmet listening");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

        info!("shutting down upstream workers");
        for stop in self.composed.worker_stops {
            let _ = stop.send(());
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("gracefully shutting down");
}
