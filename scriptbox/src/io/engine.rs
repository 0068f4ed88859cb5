//! Embedded interpreter engine and per-evaluation execution scopes.
//!
//! One [`Engine`] lives for the lifetime of a worker and builds a QuickJS
//! runtime per evaluation. Every evaluation opens an [`EvalScope`] on that
//! runtime: a brand-new context, a fresh capability bridge and a
//! [`HandleArena`]. The scope's `Drop` releases the arena, drops
//! the context and collects garbage, so teardown happens on success, on fault
//! and on early setup failure alike.
//!
//! Engine values are bound to the `Context::with` closure by lifetime and are
//! converted to JSON before leaving it. The only handles that live longer are
//! the `Persistent`s held by the arena.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result};
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Object, Persistent, Runtime,
    Value,
};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, trace};

use crate::core::modules::{ModuleMap, normalize_module_name};
use crate::core::ops::declared_ops;
use crate::core::types::EvalOutput;
use crate::io::bridge::{self, Capture};
use crate::io::config::EngineConfig;

/// Runs before user code in every context: removes `eval`, blocks the
/// `Function` constructor and pins every function prototype's `constructor`
/// so code generation is unreachable through prototype chains.
const HARDEN_CONTEXT: &str = r#"
(() => {
    "use strict";
    delete globalThis.eval;
    const NativeFunction = Function;
    const blocked = function Function() {
        throw new TypeError("dynamic code evaluation is disabled");
    };
    blocked.prototype = NativeFunction.prototype;
    Object.defineProperty(globalThis, "Function", {
        value: blocked, writable: false, configurable: false, enumerable: false
    });
    const pin = (proto) => Object.defineProperty(proto, "constructor", {
        value: undefined, writable: false, configurable: false
    });
    pin(NativeFunction.prototype);
    pin(Object.getPrototypeOf(async function () {}));
    pin(Object.getPrototypeOf(function* () {}));
    pin(Object.getPrototypeOf(async function* () {}));
})();
"#;

/// An uncaught failure during evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub message: String,
    /// Log lines captured before the fault.
    pub logs: Vec<String>,
}

/// What a single evaluation runs.
#[derive(Debug, Clone, Copy)]
pub enum Program<'p> {
    Script(&'p str),
    Module {
        entry: &'p str,
        modules: &'p ModuleMap,
    },
}

/// Interpreter limits and the termination flag, initialized once per worker.
///
/// Each evaluation gets its own runtime, so promise jobs and rejections left
/// behind by one evaluation are freed with it and never reach the next.
pub struct Engine {
    config: EngineConfig,
    terminate: Arc<AtomicBool>,
}

impl Engine {
    /// Validate the limits and build one runtime up front so a broken
    /// configuration fails at init rather than on the first evaluation.
    pub fn new(config: &EngineConfig, terminate: Arc<AtomicBool>) -> Result<Self> {
        config.validate()?;
        let engine = Self {
            config: config.clone(),
            terminate,
        };
        engine.runtime(&Arc::default())?;
        debug!(
            memory_limit_bytes = config.memory_limit_bytes,
            max_stack_bytes = config.max_stack_bytes,
            "interpreter engine initialized"
        );
        Ok(engine)
    }

    /// A runtime with heap/stack limits, an interrupt handler that aborts
    /// execution once `terminate` is raised, and a rejection tracker feeding
    /// `rejections`.
    fn runtime(&self, rejections: &Arc<Mutex<Rejections>>) -> Result<Runtime> {
        let runtime = Runtime::new().context("create interpreter runtime")?;
        runtime.set_memory_limit(self.config.memory_limit_bytes);
        runtime.set_max_stack_size(self.config.max_stack_bytes);
        let terminate = self.terminate.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || terminate.load(Ordering::Relaxed))));
        let ledger = rejections.clone();
        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            move |ctx, _promise, reason, is_handled| {
                let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                if is_handled {
                    ledger.handled();
                } else {
                    ledger.unhandled(rejection_reason(&ctx, &reason));
                }
            },
        )));
        Ok(runtime)
    }

    pub fn eval_script(&self, code: &str) -> Result<EvalOutput, Fault> {
        self.evaluate(Program::Script(code))
    }

    pub fn eval_module(&self, entry: &str, modules: &ModuleMap) -> Result<EvalOutput, Fault> {
        self.evaluate(Program::Module { entry, modules })
    }

    /// Run `program` in a fresh runtime and context.
    ///
    /// Ops are all-or-nothing: on fault only the logs survive. A promise
    /// rejection nobody handled by the end of the evaluation is a fault. On
    /// success, imperative ops come first in call order, followed by the
    /// entries of the completion value's `ops` array in array order.
    #[instrument(skip_all)]
    pub fn evaluate(&self, program: Program<'_>) -> Result<EvalOutput, Fault> {
        let rejections = Arc::new(Mutex::new(Rejections::default()));
        let runtime = self.runtime(&rejections).map_err(|err| Fault {
            message: format!("{err:#}"),
            logs: Vec::new(),
        })?;
        let scope = EvalScope::open(&runtime).map_err(|err| Fault {
            message: format!("could not create execution context: {err}"),
            logs: Vec::new(),
        })?;

        let outcome = scope
            .run(program)
            .and_then(|output| drain_jobs(&runtime, self.config.max_pending_jobs).map(|()| output))
            .and_then(|output| {
                let unhandled = rejections
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match unhandled {
                    Some(reason) => Err(format!("unhandled promise rejection: {reason}")),
                    None => Ok(output),
                }
            });
        let (mut ops, logs) = scope.capture.take();
        drop(scope);

        match outcome {
            Ok(output) => {
                ops.extend(declared_ops(&output));
                debug!(ops = ops.len(), logs = logs.len(), "evaluation completed");
                Ok(EvalOutput { ops, logs, output })
            }
            Err(message) => {
                debug!(discarded_ops = ops.len(), logs = logs.len(), %message, "evaluation faulted");
                Err(Fault { message, logs })
            }
        }
    }
}

/// Run promise jobs queued by the program until none remain. Whatever is
/// still queued on failure dies with the evaluation's runtime.
fn drain_jobs(runtime: &Runtime, limit: usize) -> Result<(), String> {
    for _ in 0..limit {
        match runtime.execute_pending_job() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(_) => return Err("uncaught exception in promise job".to_string()),
        }
    }
    if runtime.is_job_pending() {
        return Err(format!(
            "more than {limit} promise jobs pending after the program finished"
        ));
    }
    Ok(())
}

/// Promise rejections without a handler, as reported by the runtime.
#[derive(Debug, Default)]
struct Rejections {
    outstanding: usize,
    first_reason: Option<String>,
}

impl Rejections {
    fn unhandled(&mut self, reason: String) {
        self.outstanding += 1;
        self.first_reason.get_or_insert(reason);
    }

    /// A handler was attached to a previously unhandled rejection.
    fn handled(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            self.first_reason = None;
        }
    }

    fn take(&mut self) -> Option<String> {
        let outstanding = std::mem::take(&mut self.outstanding);
        let reason = self.first_reason.take();
        (outstanding > 0).then(|| reason.unwrap_or_else(|| "unknown reason".to_string()))
    }
}

fn rejection_reason<'js>(ctx: &Ctx<'js>, reason: &Value<'js>) -> String {
    reason
        .as_exception()
        .and_then(Exception::message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| bridge::describe(ctx, reason))
}

/// Persistent engine handles allocated during one evaluation.
///
/// Everything retained here is released in one sweep when the owning
/// [`EvalScope`] drops, before its context is freed.
#[derive(Default)]
pub(crate) struct HandleArena {
    handles: RefCell<Vec<Persistent<Value<'static>>>>,
}

impl HandleArena {
    /// Keep `value` alive beyond the current `with` call; returns its slot.
    pub(crate) fn retain<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> usize {
        let mut handles = self.handles.borrow_mut();
        handles.push(Persistent::save(ctx, value));
        handles.len() - 1
    }

    pub(crate) fn restore<'js>(&self, ctx: &Ctx<'js>, slot: usize) -> rquickjs::Result<Value<'js>> {
        let handle = self.handles.borrow().get(slot).cloned();
        match handle {
            Some(handle) => handle.restore(ctx),
            None => Err(Exception::throw_reference(ctx, "engine handle already released")),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.borrow().len()
    }

    /// Free every retained handle. Returns how many were released.
    pub(crate) fn release(&self) -> usize {
        let released = std::mem::take(&mut *self.handles.borrow_mut());
        let count = released.len();
        drop(released);
        count
    }
}

/// A disposable execution context plus everything bound into it.
struct EvalScope<'rt> {
    runtime: &'rt Runtime,
    context: Option<Context>,
    capture: Rc<Capture>,
    arena: Rc<HandleArena>,
}

impl<'rt> EvalScope<'rt> {
    fn open(runtime: &'rt Runtime) -> rquickjs::Result<Self> {
        let context = Context::full(runtime)?;
        trace!("execution context created");
        Ok(Self {
            runtime,
            context: Some(context),
            capture: Rc::new(Capture::default()),
            arena: Rc::new(HandleArena::default()),
        })
    }

    /// Bind the bridge, harden the context and run `program`, returning the
    /// JSON form of its completion value.
    fn run(&self, program: Program<'_>) -> Result<JsonValue, String> {
        let Some(context) = self.context.as_ref() else {
            return Err("execution context already released".to_string());
        };
        context.with(|ctx| {
            bridge::install(&ctx, &self.capture)
                .map_err(|err| format!("could not bind host functions: {err}"))?;
            let value = match program {
                Program::Script(code) => {
                    harden(&ctx)?;
                    ctx.eval::<Value, _>(code)
                        .catch(&ctx)
                        .map_err(|err| fault_message(&ctx, &err))?
                }
                Program::Module { entry, modules } => {
                    let loader = Rc::new(ModuleLoader::new(modules.clone(), self.arena.clone()));
                    ModuleLoader::install(&loader, &ctx)
                        .map_err(|err| format!("could not bind require: {err}"))?;
                    harden(&ctx)?;
                    loader
                        .load(&ctx, entry)
                        .catch(&ctx)
                        .map_err(|err| fault_message(&ctx, &err))?
                }
            };
            Ok(bridge::to_json(&ctx, &value).unwrap_or(JsonValue::Null))
        })
    }
}

impl Drop for EvalScope<'_> {
    fn drop(&mut self) {
        let released = self.arena.release();
        drop(self.context.take());
        self.runtime.run_gc();
        trace!(released, "execution context torn down");
    }
}

fn harden(ctx: &Ctx<'_>) -> Result<(), String> {
    ctx.eval::<(), _>(HARDEN_CONTEXT)
        .catch(ctx)
        .map_err(|err| format!("could not harden context: {}", fault_message(ctx, &err)))
}

/// Opaque failure string for a caught engine error.
fn fault_message<'js>(ctx: &Ctx<'js>, err: &CaughtError<'js>) -> String {
    match err {
        CaughtError::Exception(exception) => exception
            .message()
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| "uncaught exception".to_string()),
        CaughtError::Value(value) => bridge::describe(ctx, value),
        CaughtError::Error(err) => err.to_string(),
    }
}

/// CommonJS-style loader over a [`ModuleMap`].
///
/// Each module runs once per evaluation inside
/// `(function (module, exports, require) { ... })`; its `module` object is
/// cached in the arena so later `require` calls (and cycles) see the same
/// exports.
struct ModuleLoader {
    modules: ModuleMap,
    arena: Rc<HandleArena>,
    loaded: RefCell<HashMap<String, usize>>,
    require_slot: Cell<Option<usize>>,
}

impl ModuleLoader {
    fn new(modules: ModuleMap, arena: Rc<HandleArena>) -> Self {
        Self {
            modules,
            arena,
            loaded: RefCell::new(HashMap::new()),
            require_slot: Cell::new(None),
        }
    }

    /// Bind `require` globally and keep a handle to it for module wrappers.
    fn install<'js>(loader: &Rc<Self>, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let this = loader.clone();
        let require = Function::new(ctx.clone(), move |ctx: Ctx<'js>, name: String| {
            this.load(&ctx, &name)
        })?;
        let slot = loader
            .arena
            .retain(ctx, require.clone().into_value());
        loader.require_slot.set(Some(slot));
        ctx.globals().set("require", require)
    }

    fn load<'js>(&self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Value<'js>> {
        let canonical = normalize_module_name(name);
        let cached = self.loaded.borrow().get(&canonical).copied();
        if let Some(slot) = cached {
            return exports_of(ctx, &self.arena.restore(ctx, slot)?);
        }

        let Some(source) = self.modules.get(&canonical) else {
            return Err(Exception::throw_reference(
                ctx,
                &format!("module not found: '{canonical}'"),
            ));
        };
        debug!(module = %canonical, handles = self.arena.len(), "loading module");

        let module = Object::new(ctx.clone())?;
        let exports = Object::new(ctx.clone())?;
        module.set("exports", exports.clone())?;
        let slot = self.arena.retain(ctx, module.clone().into_value());
        self.loaded.borrow_mut().insert(canonical, slot);

        let require = match self.require_slot.get() {
            Some(slot) => self.arena.restore(ctx, slot)?,
            None => Value::new_undefined(ctx.clone()),
        };
        let wrapper: Function =
            ctx.eval(format!("(function (module, exports, require) {{\n{source}\n}})"))?;
        wrapper.call::<_, ()>((module.clone(), exports, require))?;
        module.get("exports")
    }
}

fn exports_of<'js>(ctx: &Ctx<'js>, module: &Value<'js>) -> rquickjs::Result<Value<'js>> {
    match module.as_object() {
        Some(module) => module.get("exports"),
        None => Err(Exception::throw_type(ctx, "module record is not an object")),
    }
}
