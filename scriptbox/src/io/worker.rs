//! The worker side of a session: a dedicated OS thread owning one engine.
//!
//! The interpreter runtime is `!Send`, so it is created on the worker thread
//! and never leaves it. Requests arrive over a std channel and are handled
//! strictly one at a time, in order; responses go back over the session's
//! tokio channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument, warn};

use crate::core::protocol::{RequestId, SandboxRequest, SandboxResponse};
use crate::core::types::EvalOutput;
use crate::io::config::EngineConfig;
use crate::io::engine::{Engine, Fault};

/// Host-side handle to a running worker thread.
pub struct WorkerHandle {
    requests: Option<mpsc::Sender<SandboxRequest>>,
    terminate: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Queue a request. Fails once the worker is gone or terminated.
    pub fn send(&self, request: SandboxRequest) -> Result<()> {
        let sender = self
            .requests
            .as_ref()
            .ok_or_else(|| anyhow!("worker terminated"))?;
        sender
            .send(request)
            .map_err(|_| anyhow!("worker request channel closed"))
    }

    /// Interrupt any running script and close the request channel.
    ///
    /// Does not join: a script stops at its next interrupt check and the
    /// thread exits on its own.
    pub fn terminate(&mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        self.requests = None;
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Start a worker thread. The engine is not created until `Init` arrives.
pub fn spawn_worker(
    config: EngineConfig,
    responses: UnboundedSender<SandboxResponse>,
) -> Result<WorkerHandle> {
    let (requests, inbox) = mpsc::channel();
    let terminate = Arc::new(AtomicBool::new(false));
    let flag = terminate.clone();
    let thread = thread::Builder::new()
        .name("scriptbox-worker".to_string())
        .spawn(move || Worker::new(config, flag).run(&inbox, &responses))
        .context("spawn sandbox worker thread")?;
    Ok(WorkerHandle {
        requests: Some(requests),
        terminate,
        thread,
    })
}

/// Worker thread state. The engine is initialized at most once.
struct Worker {
    config: EngineConfig,
    terminate: Arc<AtomicBool>,
    engine: Option<Result<Engine, String>>,
}

impl Worker {
    fn new(config: EngineConfig, terminate: Arc<AtomicBool>) -> Self {
        Self {
            config,
            terminate,
            engine: None,
        }
    }

    fn run(
        mut self,
        inbox: &mpsc::Receiver<SandboxRequest>,
        responses: &UnboundedSender<SandboxResponse>,
    ) {
        debug!("sandbox worker started");
        while let Ok(request) = inbox.recv() {
            if self.terminated() {
                break;
            }
            let response = self.handle(request);
            if self.terminated() {
                break;
            }
            if responses.send(response).is_err() {
                debug!("session dropped its response channel");
                break;
            }
        }
        debug!("sandbox worker stopped");
    }

    fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    fn engine(&mut self) -> Result<&Engine, &str> {
        let config = &self.config;
        let terminate = &self.terminate;
        self.engine
            .get_or_insert_with(|| {
                Engine::new(config, terminate.clone()).map_err(|err| format!("{err:#}"))
            })
            .as_ref()
            .map_err(String::as_str)
    }

    #[instrument(skip_all, fields(id = request.id()))]
    fn handle(&mut self, request: SandboxRequest) -> SandboxResponse {
        match request {
            SandboxRequest::Init => match self.engine() {
                Ok(_) => SandboxResponse::Ready,
                Err(message) => {
                    warn!(%message, "engine initialization failed");
                    SandboxResponse::InitFailed {
                        message: message.to_string(),
                    }
                }
            },
            SandboxRequest::Eval { id, code } => {
                let outcome = self.engine().map(|engine| engine.eval_script(&code));
                respond(id, outcome)
            }
            SandboxRequest::EvalModule { id, entry, modules } => {
                let outcome = self
                    .engine()
                    .map(|engine| engine.eval_module(&entry, &modules));
                respond(id, outcome)
            }
        }
    }
}

fn respond(id: RequestId, outcome: Result<Result<EvalOutput, Fault>, &str>) -> SandboxResponse {
    match outcome {
        Ok(Ok(payload)) => SandboxResponse::Result { id, payload },
        Ok(Err(Fault { message, logs })) => SandboxResponse::Error { id, message, logs },
        Err(reason) => SandboxResponse::Error {
            id,
            message: format!("engine unavailable: {reason}"),
            logs: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::modules::ModuleMap;
    use crate::test_support::strict;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn init_then_eval_round_trip() {
        let (tx, mut rx) = unbounded_channel();
        let worker = spawn_worker(EngineConfig::default(), tx).expect("spawn");
        worker.send(SandboxRequest::Init).expect("init");
        worker
            .send(SandboxRequest::Eval {
                id: 7,
                code: strict("console.log('hi'); 1 + 1;"),
            })
            .expect("eval");

        assert_eq!(rx.blocking_recv(), Some(SandboxResponse::Ready));
        match rx.blocking_recv() {
            Some(SandboxResponse::Result { id, payload }) => {
                assert_eq!(id, 7);
                assert_eq!(payload.logs, vec!["hi".to_string()]);
                assert_eq!(payload.output, serde_json::json!(2));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn requests_are_answered_in_order() {
        let (tx, mut rx) = unbounded_channel();
        let worker = spawn_worker(EngineConfig::default(), tx).expect("spawn");
        worker.send(SandboxRequest::Init).expect("init");
        for id in 1..=3 {
            worker
                .send(SandboxRequest::Eval {
                    id,
                    code: strict("0;"),
                })
                .expect("eval");
        }
        assert_eq!(rx.blocking_recv(), Some(SandboxResponse::Ready));
        let ids: Vec<u64> = (0..3)
            .filter_map(|_| match rx.blocking_recv() {
                Some(SandboxResponse::Result { id, .. }) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn fault_is_reported_as_error_with_logs() {
        let (tx, mut rx) = unbounded_channel();
        let worker = spawn_worker(EngineConfig::default(), tx).expect("spawn");
        worker
            .send(SandboxRequest::EvalModule {
                id: 1,
                entry: "main.js".to_string(),
                modules: ModuleMap::normalize([(
                    "main.js",
                    strict("console.log('x'); throw new Error('nope');"),
                )]),
            })
            .expect("send");
        assert_eq!(
            rx.blocking_recv(),
            Some(SandboxResponse::Error {
                id: 1,
                message: "nope".to_string(),
                logs: vec!["x".to_string()],
            })
        );
    }

    #[test]
    fn failed_init_keeps_worker_answering() {
        let (tx, mut rx) = unbounded_channel();
        let config = EngineConfig {
            memory_limit_bytes: 1,
            ..EngineConfig::default()
        };
        let worker = spawn_worker(config, tx).expect("spawn");
        worker.send(SandboxRequest::Init).expect("init");
        worker
            .send(SandboxRequest::Eval {
                id: 1,
                code: strict("1;"),
            })
            .expect("eval");
        assert!(matches!(
            rx.blocking_recv(),
            Some(SandboxResponse::InitFailed { .. })
        ));
        match rx.blocking_recv() {
            Some(SandboxResponse::Error { id, message, .. }) => {
                assert_eq!(id, 1);
                assert!(message.starts_with("engine unavailable"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn terminate_stops_runaway_script() {
        let (tx, mut rx) = unbounded_channel();
        let mut worker = spawn_worker(EngineConfig::default(), tx).expect("spawn");
        worker.send(SandboxRequest::Init).expect("init");
        assert_eq!(rx.blocking_recv(), Some(SandboxResponse::Ready));
        worker
            .send(SandboxRequest::Eval {
                id: 1,
                code: strict("while (true) {}"),
            })
            .expect("eval");
        worker.terminate();
        assert!(worker.send(SandboxRequest::Init).is_err());

        // The channel closes without answering the interrupted request.
        assert_eq!(rx.blocking_recv(), None);
        for _ in 0..200 {
            if worker.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(worker.is_finished());
    }
}
