//! Host-side sandbox session.
//!
//! A [`Session`] owns one worker thread and correlates asynchronous requests
//! with the worker's responses. Scripts are validated on the caller's task
//! before anything is sent; a rejected script never reaches the worker.
//!
//! Responses are routed by a tokio task that settles `oneshot` waiters kept
//! in a [`PendingTable`]. Disposal closes the table, so every in-flight and
//! later call observes [`SandboxError::Disposed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::modules::{ModuleMap, normalize_module_name};
use crate::core::protocol::{RequestId, SandboxRequest, SandboxResponse};
use crate::core::types::{EvalOutput, ModuleFailure};
use crate::core::validator::validate_with;
use crate::error::SandboxError;
use crate::io::config::SandboxConfig;
use crate::io::worker::{WorkerHandle, spawn_worker};

type Outcome = Result<EvalOutput, SandboxError>;

/// In-flight requests awaiting a worker response.
#[derive(Debug, Default)]
pub struct PendingTable {
    waiters: HashMap<RequestId, oneshot::Sender<Outcome>>,
    closed: bool,
}

impl PendingTable {
    /// Track `id`; fails with `Disposed` once the table is closed.
    pub fn register(&mut self, id: RequestId) -> Result<oneshot::Receiver<Outcome>, SandboxError> {
        if self.closed {
            return Err(SandboxError::Disposed);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Deliver `outcome` to the waiter for `id`. Returns `false` for ids that
    /// are not (or no longer) pending.
    pub fn settle(&mut self, id: RequestId, outcome: Outcome) -> bool {
        match self.waiters.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn forget(&mut self, id: RequestId) {
        self.waiters.remove(&id);
    }

    /// Reject every waiter with `reason()` and refuse new registrations.
    /// Returns how many waiters were rejected.
    pub fn close(&mut self, reason: impl Fn() -> SandboxError) -> usize {
        self.closed = true;
        let waiters = std::mem::take(&mut self.waiters);
        let count = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(reason()));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Engine readiness as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Starting,
    Ready,
    Failed(String),
    Closed,
}

/// State shared between the session and its response router.
struct Shared {
    pending: Mutex<PendingTable>,
    readiness: watch::Sender<Readiness>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An isolated script-execution session backed by one worker thread.
///
/// Must be created inside a tokio runtime. Dropping the session disposes it.
pub struct Session {
    config: SandboxConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
    router: JoinHandle<()>,
    next_id: AtomicU64,
    dispatched: AtomicU64,
}

impl Session {
    /// Start the worker, the response router, and request engine
    /// initialization.
    #[instrument(skip_all)]
    pub fn spawn(config: SandboxConfig) -> Result<Self, SandboxError> {
        let (responses, inbox) = unbounded_channel();
        let worker = spawn_worker(config.engine.clone(), responses).map_err(|err| {
            SandboxError::Initialization {
                message: format!("{err:#}"),
            }
        })?;
        worker
            .send(SandboxRequest::Init)
            .map_err(|_| SandboxError::WorkerTerminated)?;

        let (readiness, _) = watch::channel(Readiness::Starting);
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable::default()),
            readiness,
        });
        let router = tokio::spawn(route_responses(inbox, shared.clone()));
        info!(timeout_ms = config.eval_timeout_ms, "sandbox session started");

        Ok(Self {
            config,
            shared,
            worker: Mutex::new(Some(worker)),
            router,
            next_id: AtomicU64::new(1),
            dispatched: AtomicU64::new(0),
        })
    }

    /// Validate and run a script in a fresh context.
    pub async fn evaluate(&self, code: &str) -> Result<EvalOutput, SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::Disposed);
        }
        let result = validate_with(code, &self.config.validator);
        if !result.ok() {
            debug!(findings = result.errors.len(), "script rejected");
            return Err(SandboxError::Validation {
                errors: result.errors,
            });
        }
        let code = code.to_string();
        self.dispatch(move |id| SandboxRequest::Eval { id, code })
            .await
    }

    /// Validate every module and run `entry` with `require` over the map.
    ///
    /// Keys and `entry` are canonicalized first; validation failures across
    /// all modules are reported together.
    pub async fn evaluate_module<I, K, V>(
        &self,
        entry: &str,
        modules: I,
    ) -> Result<EvalOutput, SandboxError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        if self.is_disposed() {
            return Err(SandboxError::Disposed);
        }
        let modules = ModuleMap::normalize(modules);
        let entry = normalize_module_name(entry);
        if modules.is_empty() {
            return Err(SandboxError::ModuleNotFound { entry });
        }
        debug!(modules = modules.len(), entry = %entry, "validating modules");

        let failures: Vec<ModuleFailure> = modules
            .iter()
            .filter_map(|(name, source)| {
                let result = validate_with(source, &self.config.validator);
                (!result.ok()).then(|| ModuleFailure {
                    module: name.to_string(),
                    errors: result.errors,
                })
            })
            .collect();
        if !failures.is_empty() {
            debug!(modules = failures.len(), "modules rejected");
            return Err(SandboxError::ModuleValidation { failures });
        }
        if !modules.contains(&entry) {
            debug!(
                entry = %entry,
                available = ?modules.names().collect::<Vec<_>>(),
                "entry module missing"
            );
            return Err(SandboxError::ModuleNotFound { entry });
        }

        self.dispatch(move |id| SandboxRequest::EvalModule { id, entry, modules })
            .await
    }

    /// Reject all pending requests and stop the worker. Idempotent.
    pub fn dispose(&self) {
        let rejected = self.shared.pending().close(|| SandboxError::Disposed);
        self.shared.readiness.send_replace(Readiness::Closed);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut worker) = worker {
            worker.terminate();
            info!(rejected, "sandbox session disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.pending().is_closed()
    }

    /// Requests currently awaiting a response.
    pub fn pending(&self) -> usize {
        self.shared.pending().len()
    }

    /// Requests handed to the worker over the session's lifetime.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    async fn wait_ready(&self) -> Result<(), SandboxError> {
        let mut readiness = self.shared.readiness.subscribe();
        let state = readiness
            .wait_for(|state| *state != Readiness::Starting)
            .await
            .map_err(|_| SandboxError::Disposed)?
            .clone();
        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(message) => Err(SandboxError::Initialization { message }),
            Readiness::Starting | Readiness::Closed => Err(SandboxError::Disposed),
        }
    }

    #[instrument(skip_all)]
    async fn dispatch(
        &self,
        request: impl FnOnce(RequestId) -> SandboxRequest,
    ) -> Result<EvalOutput, SandboxError> {
        self.wait_ready().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.shared.pending().register(id)?;
        let sent = match self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(worker) => worker.send(request(id)).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.pending().forget(id);
            return Err(SandboxError::Disposed);
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(id, "request dispatched");

        let settled = match self.config.eval_timeout() {
            None => response.await,
            Some(after) => match tokio::time::timeout(after, response).await {
                Ok(settled) => settled,
                Err(_) => {
                    warn!(id, ?after, "evaluation timed out; disposing session");
                    self.shared.pending().forget(id);
                    self.dispose();
                    return Err(SandboxError::Timeout { after });
                }
            },
        };
        settled.unwrap_or(Err(SandboxError::Disposed))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
        self.router.abort();
    }
}

/// Settle waiters from worker responses until the worker goes away.
async fn route_responses(mut inbox: UnboundedReceiver<SandboxResponse>, shared: Arc<Shared>) {
    while let Some(response) = inbox.recv().await {
        match response {
            SandboxResponse::Ready => {
                debug!("sandbox engine ready");
                shared.readiness.send_replace(Readiness::Ready);
            }
            SandboxResponse::InitFailed { message } => {
                warn!(%message, "sandbox engine failed to initialize");
                shared.readiness.send_replace(Readiness::Failed(message));
            }
            SandboxResponse::Result { id, payload } => {
                if !shared.pending().settle(id, Ok(payload)) {
                    debug!(id, "discarding response for unknown request");
                }
            }
            SandboxResponse::Error { id, message, logs } => {
                if !shared
                    .pending()
                    .settle(id, Err(SandboxError::Runtime { message, logs }))
                {
                    debug!(id, "discarding error for unknown request");
                }
            }
        }
    }

    let mut pending = shared.pending();
    if !pending.is_closed() {
        let rejected = pending.close(|| SandboxError::WorkerTerminated);
        drop(pending);
        shared.readiness.send_replace(Readiness::Closed);
        warn!(rejected, "sandbox worker exited unexpectedly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ops::SandboxOp;
    use crate::core::types::FindingKind;
    use crate::error::ErrorKind;
    use crate::test_support::strict;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn pending_table_settles_and_closes() {
        let mut table = PendingTable::default();
        let mut first = table.register(1).expect("register");
        let mut second = table.register(2).expect("register");
        assert_eq!(table.len(), 2);

        assert!(table.settle(1, Ok(EvalOutput::default())));
        assert!(!table.settle(1, Ok(EvalOutput::default())));
        assert!(matches!(first.try_recv(), Ok(Ok(_))));

        assert_eq!(table.close(|| SandboxError::Disposed), 1);
        assert!(matches!(second.try_recv(), Ok(Err(SandboxError::Disposed))));
        assert!(table.is_empty());
        assert!(matches!(table.register(3), Err(SandboxError::Disposed)));
    }

    #[tokio::test]
    async fn evaluates_shorthand_script() {
        let session = Session::spawn(SandboxConfig::default()).expect("spawn");
        let output = session
            .evaluate(&strict("setRule('physics.gravity', 50);"))
            .await
            .expect("evaluate");
        assert_eq!(
            output.ops,
            vec![SandboxOp::SetRule {
                path: "physics.gravity".to_string(),
                value: 50.0,
            }]
        );
        assert_eq!(session.dispatched(), 1);
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn rejected_script_never_reaches_worker() {
        let session = Session::spawn(SandboxConfig::default()).expect("spawn");
        let err = session
            .evaluate("setRule('a', 1);")
            .await
            .expect_err("missing marker");
        match &err {
            SandboxError::Validation { errors } => {
                assert_eq!(errors[0].kind, FindingKind::MissingStrictMode);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(session.dispatched(), 0);
    }

    #[tokio::test]
    async fn runtime_fault_carries_logs_but_no_ops() {
        let session = Session::spawn(SandboxConfig::default()).expect("spawn");
        let err = session
            .evaluate(&strict(
                "console.log('partial'); emit({op: 'setRule', path: 'a', value: 1}); throw new Error('bad');",
            ))
            .await
            .expect_err("fault");
        match err {
            SandboxError::Runtime { message, logs } => {
                assert_eq!(message, "bad");
                assert_eq!(logs, vec!["partial".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_are_correlated() {
        let session = Session::spawn(SandboxConfig::default()).expect("spawn");
        let (ra, rb, rc) = (strict("'a';"), strict("'b';"), strict("'c';"));
        let (a, b, c) = tokio::join!(
            session.evaluate(&ra),
            session.evaluate(&rb),
            session.evaluate(&rc),
        );
        assert_eq!(a.expect("a").output, json!("a"));
        assert_eq!(b.expect("b").output, json!("b"));
        assert_eq!(c.expect("c").output, json!("c"));
        assert_eq!(session.dispatched(), 3);
    }

    #[tokio::test]
    async fn module_keys_collapse_and_entry_is_normalized() {
        let session = Session::spawn(SandboxConfig::default()).expect("spawn");
        let output = session
            .evaluate_module(
                "./main.js",
                [
                    ("main.js", strict("module.exports = require('./a.js').value;")),
                    ("a.js", strict("exports.value = 'plain';")),
                    ("./a.js", strict("exports.value = 'dotted';")),
                ],
            )
            .await
            .expect("evaluate");
        // "a.js" sorts after "./a.js", so its source wins.
        assert_eq!(output.output, json!("plain"));
    }

    #[tokio::test]
    async fn module_failures_are_aggregated() {
        let session = Session::spawn(SandboxConfig::default()).expect("spawn");
        let err = session
            .evaluate_module(
                "main.js",
                [
                    ("main.js", strict("import x from 'y';")),
                    ("lib.js", strict("debugger;")),
                    ("ok.js", strict("1;")),
                ],
            )
            .await
            .expect_err("rejected");
        match err {
            SandboxError::ModuleValidation { failures } => {
                let names: Vec<&str> = failures.iter().map(|f| f.module.as_str()).collect();
                assert_eq!(names, vec!["lib.js", "main.js"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_entry_module_is_reported() {
        let session = Session::spawn(SandboxConfig::default()).expect("spawn");
        let err = session
            .evaluate_module("main.js", [("lib.js", strict("1;"))])
            .await
            .expect_err("missing");
        assert!(matches!(err, SandboxError::ModuleNotFound { ref entry } if entry == "main.js"));
        assert_eq!(err.kind(), ErrorKind::ModuleResolution);

        let err = session
            .evaluate_module("./main.js", Vec::<(String, String)>::new())
            .await
            .expect_err("empty map");
        assert!(matches!(err, SandboxError::ModuleNotFound { ref entry } if entry == "main.js"));
        assert_eq!(session.dispatched(), 0);
    }

    #[tokio::test]
    async fn dispose_rejects_pending_and_later_calls() {
        let session = Arc::new(Session::spawn(SandboxConfig::default()).expect("spawn"));
        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.evaluate(&strict("while (true) {}")).await })
        };
        while session.pending() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        session.dispose();
        session.dispose();

        let err = running.await.expect("join").expect_err("disposed");
        assert!(matches!(err, SandboxError::Disposed));
        assert!(session.is_disposed());
        assert!(matches!(
            session.evaluate(&strict("1;")).await,
            Err(SandboxError::Disposed)
        ));
        assert!(matches!(
            session.evaluate_module("a.js", [("a.js", strict("1;"))]).await,
            Err(SandboxError::Disposed)
        ));
    }

    #[tokio::test]
    async fn timeout_disposes_the_session() {
        let config = SandboxConfig {
            eval_timeout_ms: Some(100),
            ..SandboxConfig::default()
        };
        let session = Session::spawn(config).expect("spawn");
        let err = session
            .evaluate(&strict("while (true) {}"))
            .await
            .expect_err("timeout");
        assert!(matches!(err, SandboxError::Timeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Disposal);
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn init_failure_surfaces_on_evaluate() {
        let mut config = SandboxConfig::default();
        config.engine.memory_limit_bytes = 1;
        let session = Session::spawn(config).expect("spawn");
        let err = session
            .evaluate(&strict("1;"))
            .await
            .expect_err("init failed");
        assert_eq!(err.kind(), ErrorKind::Initialization);
        assert_eq!(session.dispatched(), 0);
    }
}
