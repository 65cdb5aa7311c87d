//! Upstream Server — component A. Mediates all work targeting one backend
//! URI: a single worker task serializes requests through a bounded channel,
//! counts failures, and periodically resets the counter to implement
//! passive rehabilitation.
//!
//! Ported from `internal/upstream/upstream.go` and the state machine
//! described in spec §4.A: the Go source's `loop()` simply ran `r.F(h.uri)`
//! per dequeued request with no deadline or failure accounting, which a
//! later revision (tested by `upstream_test.go`'s `ErrPassiveHealthCheck`
//! cases) grew into the full state machine below.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::AppError;

/// A unit of work submitted to an [`UpstreamServer`]. `work` is invoked
/// exactly once by the server's worker; `done` fires exactly once with the
/// outcome.
///
/// `done` must be a buffered channel (a `oneshot` satisfies this) so that a
/// submitter who has stopped waiting (inbound request canceled) never
/// blocks the worker's send.
pub struct UpstreamRequest {
    pub work: Work,
    pub done: oneshot::Sender<Result<(), AppError>>,
}

/// The context handed to `work`: the server's own URI and the deadline this
/// invocation must respect.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub uri: String,
    pub deadline: Instant,
}

pub type Work =
    Box<dyn FnOnce(RequestContext) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send>> + Send>;

/// Server availability, written only by the worker task (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Available,
    Unavailable,
}

/// One backend endpoint: a URI, its policy knobs, and the shared atomics
/// the balancer reads. Cheap to clone (`Arc` internally); pass around as
/// `Arc<UpstreamServer>`.
#[derive(Debug)]
pub struct UpstreamServer {
    uri: String,
    weight: u32,
    max_fail: usize,
    fail_timeout: Duration,
    sender: mpsc::Sender<UpstreamRequest>,
    failure_count: Arc<AtomicUsize>,
    available: Arc<AtomicBool>,
}

impl UpstreamServer {
    /// Builds a server and its worker. The worker is not yet running — call
    /// [`Worker::run`] (typically via `tokio::spawn`) to put it in service,
    /// matching §3: "a background worker task is spawned when the server
    /// enters service."
    pub fn new(
        uri: impl Into<String>,
        weight: u32,
        max_fail: usize,
        fail_timeout: Duration,
        queue_size: usize,
    ) -> (Arc<Self>, Worker) {
        let (sender, receiver) = mpsc::channel(queue_size);
        let failure_count = Arc::new(AtomicUsize::new(0));
        let available = Arc::new(AtomicBool::new(true));

        let server = Arc::new(Self {
            uri: uri.into(),
            weight,
            max_fail,
            fail_timeout,
            sender,
            failure_count: failure_count.clone(),
            available: available.clone(),
        });

        let worker = Worker {
            uri: server.uri.clone(),
            max_fail,
            fail_timeout,
            receiver,
            failure_count,
            available,
        };

        (server, worker)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Immutable after construction (§4.A).
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Safe under concurrent reads — a snapshot of the availability flag.
    pub fn available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Submits a request. Blocks (backpressure) if the queue is full;
    /// fails only if the server has already shut down — in which case the
    /// caller, not `Done`, carries the error, since no worker remains to
    /// fire it (§3 invariant 6: no writes to the channel after shutdown).
    pub async fn enqueue(&self, req: UpstreamRequest) -> Result<(), AppError> {
        self.sender
            .send(req)
            .await
            .map_err(|_| AppError::UpstreamUnavailable)
    }
}

/// The long-running task that owns one server's failure counter and
/// availability flag. Exactly one `Worker` exists per `UpstreamServer`.
pub struct Worker {
    uri: String,
    max_fail: usize,
    fail_timeout: Duration,
    receiver: mpsc::Receiver<UpstreamRequest>,
    failure_count: Arc<AtomicUsize>,
    available: Arc<AtomicBool>,
}

impl Worker {
    /// Runs until `stop` fires. A three-way non-deterministic select
    /// between incoming work, the rehabilitation tick, and shutdown (§5).
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.fail_timeout);
        ticker.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                _ = &mut stop => {
                    debug!(uri = %self.uri, "upstream worker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.rehabilitate();
                }
                req = self.receiver.recv() => {
                    match req {
                        Some(req) => self.process(req).await,
                        None => break,
                    }
                }
            }
        }
    }

    fn rehabilitate(&self) {
        let fails = self.failure_count.swap(0, Ordering::Relaxed);
        let healthy = fails < self.max_fail;
        let was_healthy = self.available.swap(healthy, Ordering::Relaxed);
        if was_healthy && !healthy {
            warn!(uri = %self.uri, fails, max_fail = self.max_fail, "upstream marked unavailable");
        } else if !was_healthy && healthy {
            debug!(uri = %self.uri, "upstream rehabilitated");
        }
    }

    async fn process(&self, req: UpstreamRequest) {
        let deadline = Instant::now() + self.fail_timeout;
        let ctx = RequestContext {
            uri: self.uri.clone(),
            deadline,
        };

        let fail_timeout = self.fail_timeout;
        let work = req.work;

        // Run on its own task so a panic inside `work` is caught as a
        // `JoinError` rather than taking the worker down with it.
        let handle = tokio::spawn(async move { tokio::time::timeout(fail_timeout, work(ctx)).await });

        let result = match handle.await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_elapsed)) => Err(AppError::UpstreamTransport(
                "request deadline exceeded".to_string(),
            )),
            Err(join_err) if join_err.is_panic() => {
                warn!(uri = %self.uri, "upstream worker recovered a panic in F");
                Err(AppError::PanicInWorker)
            }
            Err(_) => Err(AppError::UpstreamTransport("worker task cancelled".to_string())),
        };

        if result.is_err() {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }

        // The receiver may already be gone (inbound request canceled);
        // that is not this worker's problem.
        let _ = req.done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_worker(w: Worker) -> oneshot::Sender<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(w.run(stop_rx));
        stop_tx
    }

    fn ok_work() -> Work {
        Box::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    fn err_work() -> Work {
        Box::new(|_ctx| Box::pin(async { Err(AppError::UpstreamTransport("boom".into())) }))
    }

    fn sleeping_work(d: Duration) -> Work {
        Box::new(move |_ctx| {
            Box::pin(async move {
                tokio::time::sleep(d).await;
                Ok(())
            })
        })
    }

    fn panicking_work() -> Work {
        Box::new(|_ctx| Box::pin(async { panic!("intentional test panic") }))
    }

    async fn submit(server: &UpstreamServer, work: Work) -> Result<(), AppError> {
        let (done_tx, done_rx) = oneshot::channel();
        server
            .enqueue(UpstreamRequest { work, done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap()
    }

    #[tokio::test]
    async fn available_with_no_failures() {
        let (server, worker) = UpstreamServer::new("foo.com", 3, 10, Duration::from_secs(1), 10);
        let _stop = spawn_worker(worker);

        for _ in 0..50 {
            submit(&server, ok_work()).await.unwrap();
        }

        assert!(server.available());
        assert_eq!(server.weight(), 3);
    }

    #[tokio::test]
    async fn available_with_some_errors_below_threshold() {
        let (server, worker) = UpstreamServer::new("foo.com", 3, 10, Duration::from_secs(1), 10);
        let _stop = spawn_worker(worker);

        for i in 0..50 {
            let res = if i < 9 { submit(&server, err_work()).await } else { submit(&server, ok_work()).await };
            let _ = res;
        }

        assert!(server.available());
    }

    #[tokio::test]
    async fn unavailable_after_max_fail_errors() {
        let (server, worker) = UpstreamServer::new("foo.com", 3, 10, Duration::from_secs(1), 10);
        let _stop = spawn_worker(worker);

        for _ in 0..50 {
            let _ = submit(&server, err_work()).await;
        }
        // Give the tick a moment to fire before the test asserts.
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(!server.available());
    }

    #[tokio::test]
    async fn unavailable_due_to_timeouts() {
        let (server, worker) = UpstreamServer::new("foo.com", 3, 3, Duration::from_millis(100), 10);
        let _stop = spawn_worker(worker);

        for _ in 0..5 {
            let _ = submit(&server, sleeping_work(Duration::from_millis(200))).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!server.available());
    }

    #[tokio::test]
    async fn panic_in_worker_is_recovered_and_counts_as_failure() {
        let (server, worker) = UpstreamServer::new("foo.com", 1, 10, Duration::from_secs(1), 10);
        let _stop = spawn_worker(worker);

        let err = submit(&server, panicking_work()).await.unwrap_err();
        assert!(matches!(err, AppError::PanicInWorker));

        // The worker must still be alive and able to serve further work.
        submit(&server, ok_work()).await.unwrap();
    }

    #[tokio::test]
    async fn rehabilitates_after_fail_timeout_with_no_new_failures() {
        let (server, worker) = UpstreamServer::new("foo.com", 1, 2, Duration::from_millis(50), 10);
        let _stop = spawn_worker(worker);

        for _ in 0..3 {
            let _ = submit(&server, err_work()).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!server.available());
        assert_eq!(server.failure_count(), 0, "tick must reset the counter even when unhealthy");

        // No new failures in this window; the next tick should rehabilitate.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(server.available());
    }

    #[tokio::test]
    async fn fifo_per_server() {
        let (server, worker) = UpstreamServer::new("foo.com", 1, 10, Duration::from_secs(5), 10);
        let _stop = spawn_worker(worker);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut receivers = Vec::new();

        for i in 0..20 {
            let order = order.clone();
            let work: Work = Box::new(move |_ctx| {
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            });
            let (done_tx, done_rx) = oneshot::channel();
            server.enqueue(UpstreamRequest { work, done: done_tx }).await.unwrap();
            receivers.push(done_rx);
        }

        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn backpressure_admits_queue_size_plus_one() {
        let (server, worker) = UpstreamServer::new("foo.com", 1, 10, Duration::from_secs(5), 3);
        let _stop = spawn_worker(worker);

        let gate = Arc::new(tokio::sync::Notify::new());
        let mut receivers = Vec::new();

        // First submission is immediately dequeued and blocks in `work`
        // until we release the gate.
        let gate_clone = gate.clone();
        let work: Work = Box::new(move |_ctx| {
            Box::pin(async move {
                gate_clone.notified().await;
                Ok(())
            })
        });
        let (done_tx, done_rx) = oneshot::channel();
        server.enqueue(UpstreamRequest { work, done: done_tx }).await.unwrap();
        receivers.push(done_rx);

        // Let the worker actually pick it up before filling the buffer.
        tokio::task::yield_now().await;

        for _ in 0..3 {
            let (done_tx, done_rx) = oneshot::channel();
            server
                .enqueue(UpstreamRequest { work: ok_work(), done: done_tx })
                .await
                .unwrap();
            receivers.push(done_rx);
        }

        // The 5th submission (queue_size=3, +1 in flight) must block.
        let blocked = {
            let server = server.clone();
            let fut = async move {
                let (done_tx, _done_rx) = oneshot::channel();
                server.enqueue(UpstreamRequest { work: ok_work(), done: done_tx }).await
            };
            tokio::time::timeout(Duration::from_millis(50), fut).await
        };
        assert!(blocked.is_err(), "5th submission should have blocked");

        gate.notify_one();
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
    }
}
