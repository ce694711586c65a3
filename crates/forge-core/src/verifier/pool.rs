//! Fixed-size worker pool for sandboxed custom verifier execution.
//!
//! Workers are modelled as tokio tasks pulling call ids off a shared queue
//! and looking the payload up in a call-id-keyed registry -- the same shape
//! the spec describes ("a single worker ID counter... pairs each dispatched
//! call to its pending callback via a map keyed by call id"). Each worker
//! delegates the actual execution to a pluggable `VerifierExecutor`; a
//! deployment that needs OS-level isolation (as the teacher's `sandbox` /
//! `worker` crates provide for whole agent sessions via `nono`) supplies an
//! executor that shells out to a sandboxed subprocess per call. The pool
//! itself only owns dispatch, timeout, and crash/shutdown bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::domain::VerifierOutcome;
use crate::verifier::VerifierRole;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_IN_FLIGHT: usize = 200;

#[derive(Debug, Clone)]
pub struct CustomVerifierCall {
    pub verifier_name: String,
    pub tool_name: String,
    pub args: Value,
    pub result: Value,
    pub role: VerifierRole,
}

/// How a worker actually runs a custom verifier. `Err` is treated as a
/// worker crash; `Ok` is the verifier's own outcome/message.
#[async_trait]
pub trait VerifierExecutor: Send + Sync {
    async fn execute(&self, call: &CustomVerifierCall) -> Result<(VerifierOutcome, String), String>;
}

type PendingCallback = oneshot::Sender<(VerifierOutcome, String)>;

struct PoolInner {
    jobs: Mutex<HashMap<u64, (CustomVerifierCall, PendingCallback)>>,
    pending: AtomicUsize,
    next_id: AtomicU64,
    queue_cap: usize,
    executor: Arc<dyn VerifierExecutor>,
    shutting_down: AtomicBool,
}

pub struct VerifierWorkerPool {
    inner: Arc<PoolInner>,
    dispatch_tx: Mutex<Option<mpsc::Sender<u64>>>,
}

fn default_worker_count() -> usize {
    num_cpus::get().min(4).max(1)
}

impl VerifierWorkerPool {
    pub fn new(executor: Arc<dyn VerifierExecutor>) -> Self {
        Self::with_config(executor, default_worker_count(), MAX_IN_FLIGHT)
    }

    pub fn with_config(executor: Arc<dyn VerifierExecutor>, worker_count: usize, queue_cap: usize) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<u64>(queue_cap.max(1));
        let inner = Arc::new(PoolInner {
            jobs: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            queue_cap,
            executor,
            shutting_down: AtomicBool::new(false),
        });

        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        for _ in 0..worker_count.max(1) {
            let inner = Arc::clone(&inner);
            let dispatch_rx = Arc::clone(&dispatch_rx);
            tokio::spawn(async move {
                loop {
                    let call_id = {
                        let mut rx = dispatch_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(call_id) = call_id else {
                        break; // channel closed: pool is shutting down.
                    };
                    // Peek the call without removing it yet: the entry stays
                    // in `jobs` for the whole execution so a concurrent
                    // `shutdown()` can still see and resolve it as in-flight.
                    let call = inner.jobs.lock().get(&call_id).map(|(call, _)| call.clone());
                    let Some(call) = call else {
                        continue; // already resolved by a concurrent shutdown.
                    };
                    let outcome = run_with_timeout(&inner.executor, &call).await;
                    // Whichever side removes the entry first wins the
                    // respond; a shutdown racing this completion just means
                    // the worker's own outcome is discarded.
                    if let Some((_, respond)) = inner.jobs.lock().remove(&call_id) {
                        inner.pending.fetch_sub(1, Ordering::SeqCst);
                        let _ = respond.send(outcome);
                    }
                }
            });
        }

        VerifierWorkerPool {
            inner,
            dispatch_tx: Mutex::new(Some(dispatch_tx)),
        }
    }

    /// First idle worker wins (the shared queue hands the call to whichever
    /// worker polls next); if none idle the call waits in the bounded
    /// channel; if the in-flight count is already at cap, synthesise an
    /// outcome rather than blocking the caller.
    pub async fn dispatch(&self, call: CustomVerifierCall) -> (VerifierOutcome, String) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return (call.role.fallback_outcome(), "shutting down".to_string());
        }
        if self.inner.pending.load(Ordering::SeqCst) >= self.inner.queue_cap {
            return (call.role.fallback_outcome(), "queue full — dropped".to_string());
        }
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        let call_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.jobs.lock().insert(call_id, (call.clone(), tx));

        let sender = self.dispatch_tx.lock().clone();
        let sent = match sender {
            Some(sender) => sender.send(call_id).await.is_ok(),
            None => false,
        };
        if !sent {
            self.inner.jobs.lock().remove(&call_id);
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            return (call.role.fallback_outcome(), "shutting down".to_string());
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => (call.role.fallback_outcome(), "shutting down".to_string()),
        }
    }

    /// Terminates every worker and resolves every in-flight and queued call.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        // Dropping the sender closes the channel so every worker's `recv`
        // returns `None` and its loop exits.
        self.dispatch_tx.lock().take();
        let drained: Vec<(u64, (CustomVerifierCall, PendingCallback))> =
            self.inner.jobs.lock().drain().collect();
        for (_, (call, respond)) in drained {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            let _ = respond.send((call.role.fallback_outcome(), "shutting down".to_string()));
        }
    }
}

async fn run_with_timeout(executor: &Arc<dyn VerifierExecutor>, call: &CustomVerifierCall) -> (VerifierOutcome, String) {
    match tokio::time::timeout(DEFAULT_TIMEOUT, executor.execute(call)).await {
        Ok(Ok((outcome, message))) => (outcome, message),
        Ok(Err(crash_message)) => (call.role.fallback_outcome(), crash_message),
        Err(_) => (call.role.fallback_outcome(), "verifier timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl VerifierExecutor for EchoExecutor {
        async fn execute(&self, _call: &CustomVerifierCall) -> Result<(VerifierOutcome, String), String> {
            Ok((VerifierOutcome::Pass, "ok".to_string()))
        }
    }

    struct HangingExecutor;

    #[async_trait]
    impl VerifierExecutor for HangingExecutor {
        async fn execute(&self, _call: &CustomVerifierCall) -> Result<(VerifierOutcome, String), String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok((VerifierOutcome::Pass, "too late".to_string()))
        }
    }

    struct CrashingExecutor;

    #[async_trait]
    impl VerifierExecutor for CrashingExecutor {
        async fn execute(&self, _call: &CustomVerifierCall) -> Result<(VerifierOutcome, String), String> {
            Err("worker exited with status 1".to_string())
        }
    }

    fn call(role: VerifierRole) -> CustomVerifierCall {
        CustomVerifierCall {
            verifier_name: "v".to_string(),
            tool_name: "t".to_string(),
            args: serde_json::json!({}),
            result: serde_json::json!({}),
            role,
        }
    }

    #[tokio::test]
    async fn dispatch_returns_executor_outcome() {
        let pool = VerifierWorkerPool::with_config(Arc::new(EchoExecutor), 2, 10);
        let (outcome, msg) = pool.dispatch(call(VerifierRole::Any)).await;
        assert_eq!(outcome, VerifierOutcome::Pass);
        assert_eq!(msg, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_role_mapped_outcome() {
        let pool = Arc::new(VerifierWorkerPool::with_config(Arc::new(HangingExecutor), 1, 10));
        let pool2 = Arc::clone(&pool);
        let handle = tokio::spawn(async move { pool2.dispatch(call(VerifierRole::Write)).await });
        tokio::time::advance(Duration::from_secs(3)).await;
        let (outcome, message) = handle.await.unwrap();
        assert_eq!(outcome, VerifierOutcome::Block);
        assert_eq!(message, "verifier timed out");
    }

    #[tokio::test]
    async fn crash_resolves_role_mapped_outcome() {
        let pool = VerifierWorkerPool::with_config(Arc::new(CrashingExecutor), 1, 10);
        let (outcome, message) = pool.dispatch(call(VerifierRole::Read)).await;
        assert_eq!(outcome, VerifierOutcome::Warn);
        assert!(message.contains("status 1"));
    }

    #[tokio::test]
    async fn queue_full_synthesises_outcome() {
        // queue_cap 0 means every dispatch finds the in-flight count
        // already at cap, so the call is never even enqueued.
        let pool = VerifierWorkerPool::with_config(Arc::new(HangingExecutor), 1, 0);
        let (outcome, message) = pool.dispatch(call(VerifierRole::Write)).await;
        assert_eq!(outcome, VerifierOutcome::Block);
        assert_eq!(message, "queue full — dropped");
    }

    #[tokio::test]
    async fn shutdown_resolves_outstanding_calls() {
        let pool = Arc::new(VerifierWorkerPool::with_config(Arc::new(HangingExecutor), 1, 10));
        let pool2 = Arc::clone(&pool);
        let handle = tokio::spawn(async move { pool2.dispatch(call(VerifierRole::Any)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;
        let (outcome, message) = handle.await.unwrap();
        assert_eq!(outcome, VerifierOutcome::Warn);
        assert_eq!(message, "shutting down");
    }
}
