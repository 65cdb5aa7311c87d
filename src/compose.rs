//! Composition — part of component E. Builds the upstream server pool, the
//! balancer, and the registered locations from a validated [`Config`].
//! Ported from `internal/compose/compose.go`.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::balancer::{Balancer, Random, RoundRobin};
use crate::config::{BalancerKind, Config, ProviderKind, UpstreamConfig};
use crate::ingress::{Ingress, Location};
use crate::protocol::{HttpAdapter, HttpOptions};
use crate::upstream::{UpstreamServer, Worker};

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("location references unknown upstream '{0}'")]
    UnknownUpstream(String),
    #[error("location has an invalid regular expression: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Everything the bootstrap needs to start serving: the assembled
/// [`Ingress`] and the stop handles for every upstream's worker, so
/// shutdown can signal them all.
pub struct Composed {
    pub ingress: Arc<Ingress>,
    pub worker_stops: Vec<oneshot::Sender<()>>,
}

impl std::fmt::Debug for Composed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composed").finish_non_exhaustive()
    }
}

const QUEUE_SIZE: usize = 100;

/// Builds the full wiring from config, matching `compose.FromConfig`:
/// for each location, fetch its upstream, build the server pool, spawn
/// workers, construct the balancer, and register (regex, adapter) with the
/// ingress.
pub fn from_config(
    cfg: &Config,
    access_log: Option<Arc<crate::access_log::AccessLog>>,
) -> Result<Composed, ComposeError> {
    let mut locations = Vec::new();
    let mut worker_stops = Vec::new();

    for loc in &cfg.server.locations {
        let upstream_cfg = cfg
            .upstreams
            .get(&loc.http_pass)
            .ok_or_else(|| ComposeError::UnknownUpstream(loc.http_pass.clone()))?;

        let (servers, workers) = build_servers(upstream_cfg);
        for worker in workers {
            let (stop_tx, stop_rx) = oneshot::channel();
            worker_stops.push(stop_tx);
            tokio::spawn(worker.run(stop_rx));
        }

        let balancer: Arc<dyn Balancer> = match upstream_cfg.balancer {
            BalancerKind::RoundRobin => Arc::new(RoundRobin::new(servers)),
            BalancerKind::Random => Arc::new(Random::new(servers)),
        };

        let pattern = Regex::new(&loc.path)?;
        let adapter = HttpAdapter::new(
            balancer,
            HttpOptions {
                pass_headers: loc.pass_headers.clone(),
            },
        );
        locations.push(Location::new(pattern, adapter));
    }

    Ok(Composed {
        ingress: Arc::new(Ingress::new(locations, access_log)),
        worker_stops,
    })
}

fn build_servers(upstream: &UpstreamConfig) -> (Vec<Arc<UpstreamServer>>, Vec<Worker>) {
    let mut servers = Vec::new();
    let mut workers = Vec::new();

    if upstream.provider == ProviderKind::Static {
        for entry in &upstream.servers {
            let (server, worker) = UpstreamServer::new(
                entry.path.clone(),
                entry.weight,
                entry.max_fail,
                Duration::from_secs(entry.fail_timeout),
                QUEUE_SIZE,
            );
            servers.push(server);
            workers.push(worker);
        }
    }

    (servers, workers)
}
