//! Capability bridge: the host functions bound into every execution context.
//!
//! The surface is fixed: `emit`, the three shorthands (`setRule`,
//! `setAbility`, `removeEntities`) and a `console` whose methods only append
//! to the evaluation's log list. Nothing here can throw into the script; a
//! malformed call is a no-op.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};
use serde_json::Value as JsonValue;
use tracing::trace;

use crate::core::ops::SandboxOp;

/// Per-evaluation sink for ops and log lines.
///
/// Shared between the bridge closures and the engine through `Rc`; it never
/// outlives the evaluation that created it.
#[derive(Debug, Default)]
pub struct Capture {
    ops: RefCell<Vec<SandboxOp>>,
    logs: RefCell<Vec<String>>,
}

impl Capture {
    pub fn record(&self, op: SandboxOp) {
        trace!(op = op.label(), "op recorded");
        self.ops.borrow_mut().push(op);
    }

    pub fn log(&self, line: String) {
        self.logs.borrow_mut().push(line);
    }

    /// Drain everything captured so far.
    pub fn take(&self) -> (Vec<SandboxOp>, Vec<String>) {
        (
            std::mem::take(&mut *self.ops.borrow_mut()),
            std::mem::take(&mut *self.logs.borrow_mut()),
        )
    }
}

/// Bind the capability surface into the context's global object.
pub fn install<'js>(ctx: &Ctx<'js>, capture: &Rc<Capture>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let sink = capture.clone();
    globals.set(
        "emit",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, Rest(args): Rest<Value<'js>>| {
                let op = args
                    .first()
                    .and_then(|value| to_json(&ctx, value))
                    .and_then(|json| SandboxOp::recognize(&json));
                match op {
                    Some(op) => sink.record(op),
                    None => trace!("emit payload is not a recognized op; dropped"),
                }
            },
        )?,
    )?;

    let sink = capture.clone();
    globals.set(
        "setRule",
        Function::new(ctx.clone(), move |Rest(args): Rest<Value<'js>>| {
            let path = args.first().and_then(js_string);
            let value = args.get(1).and_then(Value::as_number);
            match (path, value) {
                (Some(path), Some(value)) if !path.is_empty() && value.is_finite() => {
                    sink.record(SandboxOp::SetRule { path, value });
                }
                _ => trace!("setRule called with malformed arguments; ignored"),
            }
        })?,
    )?;

    let sink = capture.clone();
    globals.set(
        "setAbility",
        Function::new(ctx.clone(), move |Rest(args): Rest<Value<'js>>| {
            let name = args.first().and_then(js_string);
            let active = args.get(1).and_then(Value::as_bool);
            match (name, active) {
                (Some(name), Some(active)) if !name.is_empty() => {
                    sink.record(SandboxOp::SetAbility { name, active });
                }
                _ => trace!("setAbility called with malformed arguments; ignored"),
            }
        })?,
    )?;

    let sink = capture.clone();
    globals.set(
        "removeEntities",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, Rest(args): Rest<Value<'js>>| {
                let filter = args
                    .first()
                    .and_then(|value| to_json(&ctx, value))
                    .filter(JsonValue::is_object);
                match filter {
                    Some(filter) => sink.record(SandboxOp::RemoveEntities { filter }),
                    None => trace!("removeEntities called without an object filter; ignored"),
                }
            },
        )?,
    )?;

    let console = Object::new(ctx.clone())?;
    for method in ["log", "info", "warn", "error"] {
        let sink = capture.clone();
        console.set(
            method,
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, Rest(args): Rest<Value<'js>>| {
                    let line = args
                        .iter()
                        .map(|value| describe(&ctx, value))
                        .collect::<Vec<_>>()
                        .join(" ");
                    sink.log(line);
                },
            )?,
        )?;
    }
    globals.set("console", console)?;

    Ok(())
}

/// Structural JSON form of a value, or `None` when it has none (undefined,
/// functions, symbols, cycles, BigInt).
pub fn to_json<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<JsonValue> {
    match ctx.json_stringify(value.clone()) {
        Ok(Some(text)) => text
            .to_string()
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok()),
        Ok(None) => None,
        Err(_) => {
            // Clear the pending exception so the script keeps running.
            let _ = ctx.catch();
            None
        }
    }
}

/// Render one value for a log line: strings verbatim, JSON where possible,
/// string coercion otherwise.
pub fn describe<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if let Some(text) = js_string(value) {
        return text;
    }
    match ctx.json_stringify(value.clone()) {
        Ok(Some(text)) => {
            if let Ok(text) = text.to_string() {
                return text;
            }
        }
        Ok(None) => {}
        Err(_) => {
            let _ = ctx.catch();
        }
    }
    match value.get::<Coerced<String>>() {
        Ok(Coerced(text)) => text,
        Err(_) => {
            let _ = ctx.catch();
            format!("[{}]", value.type_name())
        }
    }
}

fn js_string(value: &Value<'_>) -> Option<String> {
    value.as_string().and_then(|text| text.to_string().ok())
}
