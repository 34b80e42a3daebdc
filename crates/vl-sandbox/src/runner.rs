//! Compiles and invokes the snippet against the current bindings.
//!
//! Every run compiles the source afresh as the body of a function whose
//! parameters are the shadowed globals followed by the exposed names. Shadowed
//! parameters receive `null`, exposed ones their bound value, and the receiver
//! is the host scope (or a fresh object).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use deno_core::v8;
use serde_json::{Map, Value};

use crate::bindings::BindingRegistry;
use crate::error::{JsException, SandboxError};
use crate::realm::{parse_json, v8_string, Realm};

/// A value an exposed name is bound to: a captured global, the logger, a
/// materialised host value or `undefined`. Each lives in the realm for as long
/// as it stays exposed, so snippet mutations carry over between runs.
pub(crate) type Binding = v8::Global<v8::Value>;

/// How a single invocation ended, before deadline and heap checks.
enum Outcome {
    /// The snippet returned; carries the serialised receiver when requested.
    Completed(Option<String>),
    CompileFailed(String),
    Threw(JsException),
    Terminated,
}

/// Terminates the isolate if the run outlives its deadline.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn arm(handle: v8::IsolateHandle, timeout: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let watchdog_fired = fired.clone();
        let (cancel, cancel_rx) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                watchdog_fired.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self {
            cancel,
            fired,
            thread,
        }
    }

    /// Stop the watchdog and report whether it fired. Joins the thread so the
    /// isolate handle is never used after the run returns.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
        self.fired.load(Ordering::SeqCst)
    }
}

/// Run `source` once against `bindings`, writing the receiver back into
/// `scope` when one is given.
pub(crate) fn run(
    realm: &mut Realm,
    source: &str,
    bindings: &BindingRegistry<Binding>,
    scope: Option<&mut Map<String, Value>>,
    timeout: Option<Duration>,
) -> Result<(), SandboxError> {
    let receiver = match &scope {
        Some(map) => Some(
            serde_json::to_string(map)
                .map_err(|e| SandboxError::engine(format!("scope is not serialisable: {e}")))?,
        ),
        None => None,
    };

    tracing::debug!(
        shadowed = bindings.globals().len(),
        exposed = bindings.exposed_len(),
        has_scope = receiver.is_some(),
        "running sandbox snippet"
    );

    realm.arm_heap_limit();
    let watchdog = timeout.map(|timeout| Watchdog::arm(realm.thread_safe_handle(), timeout));

    let outcome = invoke(realm, source, bindings, receiver.as_deref());

    // The watchdog may fire after the snippet already finished. That run
    // completed, so only a terminated outcome is reported as a timeout.
    let timed_out = watchdog.is_some_and(Watchdog::disarm);
    let heap_exceeded = realm.heap_limit_triggered();
    if timed_out || heap_exceeded {
        realm.cancel_termination();
    }
    if heap_exceeded {
        realm.restore_heap_limit();
    }

    let outcome = match outcome {
        Err(_) if heap_exceeded => return Err(SandboxError::HeapLimitExceeded),
        other => other?,
    };
    match outcome {
        Outcome::Completed(updated) => {
            if let (Some(map), Some(json)) = (scope, updated) {
                *map = serde_json::from_str(&json).map_err(|e| {
                    SandboxError::engine(format!("scope came back as invalid JSON: {e}"))
                })?;
            }
            Ok(())
        }
        _ if heap_exceeded => Err(SandboxError::HeapLimitExceeded),
        Outcome::CompileFailed(message) => {
            tracing::debug!(%message, "sandbox source failed to compile");
            Err(SandboxError::Compile { message })
        }
        Outcome::Threw(exception) => Err(SandboxError::Snippet(exception)),
        Outcome::Terminated if timed_out => Err(SandboxError::Timeout {
            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
        }),
        Outcome::Terminated => {
            realm.cancel_termination();
            Err(SandboxError::engine("execution was terminated"))
        }
    }
}

fn invoke(
    realm: &mut Realm,
    source: &str,
    bindings: &BindingRegistry<Binding>,
    receiver: Option<&str>,
) -> Result<Outcome, SandboxError> {
    let scope = &mut realm.handle_scope();

    let parameters = bindings.parameters();
    let mut names = Vec::with_capacity(parameters.len());
    let mut args = Vec::with_capacity(parameters.len());
    for name in &parameters {
        names.push(v8_string(scope, name)?);
        let arg = match bindings.get(name) {
            Some(binding) => v8::Local::new(scope, binding),
            None => v8::null(scope).into(),
        };
        args.push(arg);
    }

    let this: v8::Local<v8::Value> = match receiver {
        Some(json) => parse_json(scope, json)?,
        None => v8::Object::new(scope).into(),
    };
    let body = v8_string(scope, source)?;

    let tc = &mut v8::TryCatch::new(scope);
    let mut compile_source = v8::script_compiler::Source::new(body, None);
    let Some(function) = v8::script_compiler::compile_function(
        tc,
        &mut compile_source,
        &names,
        &[],
        v8::script_compiler::CompileOptions::NoCompileOptions,
        v8::script_compiler::NoCacheReason::NoReason,
    ) else {
        if tc.has_terminated() {
            return Ok(Outcome::Terminated);
        }
        let message = tc
            .exception()
            .map(|e| e.to_rust_string_lossy(tc))
            .unwrap_or_else(|| "unknown compile error".into());
        return Ok(Outcome::CompileFailed(message));
    };

    if function.call(tc, this, &args).is_none() {
        if tc.has_terminated() {
            return Ok(Outcome::Terminated);
        }
        let exception = match tc.exception() {
            Some(exception) => describe_exception(tc, exception),
            None => JsException {
                name: None,
                message: "snippet threw without an exception value".into(),
                stack: None,
            },
        };
        return Ok(Outcome::Threw(exception));
    }

    if receiver.is_none() {
        return Ok(Outcome::Completed(None));
    }
    match v8::json::stringify(tc, this) {
        Some(json) => Ok(Outcome::Completed(Some(json.to_rust_string_lossy(tc)))),
        None if tc.has_terminated() => Ok(Outcome::Terminated),
        None => {
            let reason = tc
                .exception()
                .map(|e| e.to_rust_string_lossy(tc))
                .unwrap_or_else(|| "unknown error".into());
            Err(SandboxError::engine(format!(
                "scope could not be serialised after the run: {reason}"
            )))
        }
    }
}

/// Pull `name`, `message` and `stack` off a thrown error object, or fall back
/// to the string conversion of any other thrown value.
fn describe_exception(
    scope: &mut v8::HandleScope,
    exception: v8::Local<v8::Value>,
) -> JsException {
    if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
        if let Some(message) = string_property(scope, object, "message") {
            return JsException {
                name: string_property(scope, object, "name"),
                message,
                stack: string_property(scope, object, "stack"),
            };
        }
    }
    JsException {
        name: None,
        message: exception.to_rust_string_lossy(scope),
        stack: None,
    }
}

fn string_property(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    key: &str,
) -> Option<String> {
    let key = v8::String::new(scope, key)?;
    let value = object.get(scope, key.into())?;
    if value.is_null_or_undefined() {
        return None;
    }
    Some(value.to_rust_string_lossy(scope))
}
