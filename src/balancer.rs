//! Balancer — component B. Ported from `internal/balancer/{balancer,
//! roundrobin, random}.go`: selects a healthy server from a pool per
//! call, either round-robin-with-weights or uniformly at random.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::AppError;
use crate::upstream::UpstreamServer;

/// Open Question (c): the Go source defined this constant in one variant
/// and omitted it in others. Fixed here at 100ms.
pub const SELECTION_BUDGET: Duration = Duration::from_millis(100);

pub trait Balancer: Send + Sync {
    /// Returns a server for which `available()` was true at the moment of
    /// observation, or [`AppError::PoolExhausted`] once the selection
    /// budget elapses without finding one.
    fn next_server(&self) -> Result<Arc<UpstreamServer>, AppError>;
}

/// Weighted round-robin balancer. Holds one mutex over `(cursor, weight
/// counters)`; never suspends while holding it.
pub struct RoundRobin {
    servers: Vec<Arc<UpstreamServer>>,
    state: Mutex<RoundRobinState>,
}

struct RoundRobinState {
    next: usize,
    weight_counts: Vec<u32>,
}

impl RoundRobin {
    pub fn new(servers: Vec<Arc<UpstreamServer>>) -> Self {
        let weight_counts = vec![0; servers.len()];
        Self {
            servers,
            state: Mutex::new(RoundRobinState { next: 0, weight_counts }),
        }
    }

    /// One step of the deterministic sequence from §4.B/§8, irrespective of
    /// availability. `next_server` loops this until it finds a healthy one.
    fn advance(&self) -> Arc<UpstreamServer> {
        let len = self.servers.len();
        let mut state = self.state.lock().expect("round robin mutex poisoned");

        let mut i = state.next;
        let mut next = state.next + 1;

        if i >= len {
            next = 1;
            i = 0;
        }

        let weight = self.servers[i].weight();
        if weight > 1 {
            let nc = state.weight_counts[i] + 1;
            if nc == weight {
                state.weight_counts[i] = 0;
            }
            if nc < weight {
                next = i;
                state.weight_counts[i] = nc;
            }
        }

        state.next = next;
        self.servers[i].clone()
    }
}

impl Balancer for RoundRobin {
    fn next_server(&self) -> Result<Arc<UpstreamServer>, AppError> {
        if self.servers.is_empty() {
            return Err(AppError::PoolExhausted);
        }
        let start = Instant::now();
        loop {
            let candidate = self.advance();
            if candidate.available() {
                return Ok(candidate);
            }
            if start.elapsed() > SELECTION_BUDGET {
                return Err(AppError::PoolExhausted);
            }
        }
    }
}

/// Stateless (other than the pool reference) random balancer.
pub struct Random {
    servers: Vec<Arc<UpstreamServer>>,
}

impl Random {
    pub fn new(servers: Vec<Arc<UpstreamServer>>) -> Self {
        Self { servers }
    }

    fn candidate(&self) -> Arc<UpstreamServer> {
        let idx = rand::thread_rng().gen_range(0..self.servers.len());
        self.servers[idx].clone()
    }
}

impl Balancer for Random {
    fn next_server(&self) -> Result<Arc<UpstreamServer>, AppError> {
        if self.servers.is_empty() {
            return Err(AppError::PoolExhausted);
        }
        let start = Instant::now();
        loop {
            let candidate = self.candidate();
            if candidate.available() {
                return Ok(candidate);
            }
            if start.elapsed() > SELECTION_BUDGET {
                return Err(AppError::PoolExhausted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dummy_pool(n: usize, weighted: bool) -> Vec<Arc<UpstreamServer>> {
        (0..n)
            .map(|i| {
                let weight = if weighted { i as u32 } else { 0 };
                let (server, worker) =
                    UpstreamServer::new("http://host1.com", weight, 10, Duration::from_secs(60), 10);
                tokio::spawn(async move {
                    let (_tx, rx) = tokio::sync::oneshot::channel();
                    worker.run(rx).await;
                });
                server
            })
            .collect()
    }

    #[tokio::test]
    async fn weightless_round_robin_sequence() {
        let pool = dummy_pool(5, false);
        let bl = RoundRobin::new(pool.clone());
        let seq: Vec<_> = (0..7).map(|_| bl.next_server().unwrap()).collect();
        let expected = [0, 1, 2, 3, 4, 0, 1];
        for (got, idx) in seq.iter().zip(expected.iter()) {
            assert!(Arc::ptr_eq(got, &pool[*idx]));
        }
    }

    #[tokio::test]
    async fn weighted_round_robin_sequence() {
        let pool = dummy_pool(5, true); // weights 0,1,2,3,4
        let bl = RoundRobin::new(pool.clone());
        let seq: Vec<_> = (0..5).map(|_| bl.next_server().unwrap()).collect();
        let expected = [0, 1, 2, 2, 3];
        for (got, idx) in seq.iter().zip(expected.iter()) {
            assert!(Arc::ptr_eq(got, &pool[*idx]));
        }
    }

    #[tokio::test]
    async fn weighted_round_robin_overflow_sequence() {
        let pool = dummy_pool(4, true); // weights 0,1,2,3
        let bl = RoundRobin::new(pool.clone());
        let seq: Vec<_> = (0..11).map(|_| bl.next_server().unwrap()).collect();
        let expected = [0, 1, 2, 2, 3, 3, 3, 0, 1, 2, 2];
        for (got, idx) in seq.iter().zip(expected.iter()) {
            assert!(Arc::ptr_eq(got, &pool[*idx]));
        }
    }

    #[tokio::test]
    async fn skips_unhealthy_servers() {
        let pool = dummy_pool(5, false);
        // Servers 1 and 2 are replaced with ones on a fast tick so driving
        // them past max_fail doesn't take a real minute (dummy_pool uses a
        // 60s fail_timeout for the sequence tests above).
        let (fast1, w1) = UpstreamServer::new("http://host1.com", 0, 10, Duration::from_millis(20), 10);
        let (fast2, w2) = UpstreamServer::new("http://host1.com", 0, 10, Duration::from_millis(20), 10);
        tokio::spawn(async move {
            let (_t, r) = tokio::sync::oneshot::channel();
            w1.run(r).await;
        });
        tokio::spawn(async move {
            let (_t, r) = tokio::sync::oneshot::channel();
            w2.run(r).await;
        });
        for server in [&fast1, &fast2] {
            for _ in 0..11 {
                let (done_tx, done_rx) = tokio::sync::oneshot::channel();
                let work: crate::upstream::Work =
                    Box::new(|_ctx| Box::pin(async { Err(AppError::UpstreamTransport("x".into())) }));
                server
                    .enqueue(crate::upstream::UpstreamRequest { work, done: done_tx })
                    .await
                    .unwrap();
                let _ = done_rx.await;
            }
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fast1.available());
        assert!(!fast2.available());

        let full_pool = vec![pool[0].clone(), fast1, fast2, pool[3].clone(), pool[4].clone()];
        let bl = RoundRobin::new(full_pool.clone());
        let seq: Vec<_> = (0..5).map(|_| bl.next_server().unwrap()).collect();
        let expected = [0usize, 3, 4, 0, 3];
        for (got, idx) in seq.iter().zip(expected.iter()) {
            assert!(Arc::ptr_eq(got, &full_pool[*idx]));
        }
    }

    #[tokio::test]
    async fn pool_exhausted_when_all_unhealthy() {
        let (s1, w1) = UpstreamServer::new("http://a", 0, 1, Duration::from_millis(10), 10);
        let (s2, w2) = UpstreamServer::new("http://b", 0, 1, Duration::from_millis(10), 10);
        tokio::spawn(async move {
            let (_t, r) = tokio::sync::oneshot::channel();
            w1.run(r).await;
        });
        tokio::spawn(async move {
            let (_t, r) = tokio::sync::oneshot::channel();
            w2.run(r).await;
        });
        for server in [&s1, &s2] {
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            let work: crate::upstream::Work =
                Box::new(|_ctx| Box::pin(async { Err(AppError::UpstreamTransport("x".into())) }));
            server
                .enqueue(crate::upstream::UpstreamRequest { work, done: done_tx })
                .await
                .unwrap();
            let _ = done_rx.await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!s1.available());
        assert!(!s2.available());

        let bl = RoundRobin::new(vec![s1, s2]);
        let err = bl.next_server().unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted));
    }

    #[tokio::test]
    async fn random_returns_single_available_server() {
        let pool = dummy_pool(1, false);
        let bl = Random::new(pool.clone());
        for _ in 0..5 {
            let got = bl.next_server().unwrap();
            assert!(Arc::ptr_eq(&got, &pool[0]));
        }
    }
}
