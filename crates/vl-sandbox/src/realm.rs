//! The JavaScript realm a sandbox runs in.
//!
//! One deno_core runtime per sandbox. The bootstrap removes `Deno` from the
//! global object and keeps a private logger closure, then the optional host
//! prelude runs. Whatever is left on `globalThis` afterwards is the ambient
//! environment the sandbox shadows.

use std::sync::atomic::{AtomicBool, Ordering};

use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde_json::Value;

use crate::error::SandboxError;
use crate::ops::sandbox_ext;
use crate::sandbox::SandboxConfig;

const BOOTSTRAP: &str = r#"
    ((ops) => {
        const toText = String;
        delete globalThis.Deno;
        return (msg) => ops.op_vl_log(toText(msg));
    })(Deno.core.ops);
"#;

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly. [`Realm::restore_heap_limit`]
/// takes the grace back after the run.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `Realm`, which is
    // dropped after the runtime, so it outlives every callback invocation.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

pub(crate) struct Realm {
    logger: v8::Global<v8::Value>,
    runtime: JsRuntime,
    heap_state: Box<HeapLimitState>,
    max_heap_size: usize,
}

impl Realm {
    pub(crate) fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![sandbox_ext::init()],
            create_params: Some(create_params),
            ..Default::default()
        });

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        let logger = runtime
            .execute_script("[vl:bootstrap]", BOOTSTRAP)
            .map_err(|e| SandboxError::engine(e.to_string()))?;

        if let Some(prelude) = &config.prelude {
            runtime
                .execute_script("[vl:prelude]", prelude.clone())
                .map_err(|e| SandboxError::Prelude {
                    message: e.to_string(),
                })?;
        }

        tracing::debug!(
            max_heap_size = config.max_heap_size,
            prelude = config.prelude.is_some(),
            "sandbox realm created"
        );

        Ok(Self {
            logger,
            runtime,
            heap_state,
            max_heap_size: config.max_heap_size,
        })
    }

    /// Own property names of the global object, symbols excluded.
    pub(crate) fn global_names(&mut self) -> Result<Vec<String>, SandboxError> {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);
        let names = global
            .get_own_property_names(
                scope,
                v8::GetPropertyNamesArgs {
                    mode: v8::KeyCollectionMode::OwnOnly,
                    property_filter: v8::PropertyFilter::SKIP_SYMBOLS,
                    index_filter: v8::IndexFilter::IncludeIndices,
                    key_conversion: v8::KeyConversionMode::ConvertToString,
                },
            )
            .ok_or_else(|| SandboxError::engine("could not list global property names"))?;

        let mut out = Vec::with_capacity(names.length() as usize);
        for index in 0..names.length() {
            if let Some(name) = names.get_index(scope, index) {
                out.push(name.to_rust_string_lossy(scope));
            }
        }
        Ok(out)
    }

    /// The current value of `globalThis[name]`, or `None` when `name in
    /// globalThis` is false.
    pub(crate) fn lookup_global(
        &mut self,
        name: &str,
    ) -> Result<Option<v8::Global<v8::Value>>, SandboxError> {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);
        let key = v8_string(scope, name)?;
        if !global.has(scope, key.into()).unwrap_or(false) {
            return Ok(None);
        }
        let value = global
            .get(scope, key.into())
            .ok_or_else(|| SandboxError::engine(format!("reading globalThis.{name} threw")))?;
        Ok(Some(v8::Global::new(scope, value)))
    }

    /// Materialise a host value in the realm with `JSON.parse` semantics.
    pub(crate) fn json_value(
        &mut self,
        value: &Value,
    ) -> Result<v8::Global<v8::Value>, SandboxError> {
        let scope = &mut self.runtime.handle_scope();
        let local = parse_json(scope, &value.to_string())?;
        Ok(v8::Global::new(scope, local))
    }

    pub(crate) fn undefined_value(&mut self) -> v8::Global<v8::Value> {
        let scope = &mut self.runtime.handle_scope();
        let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();
        v8::Global::new(scope, undefined)
    }

    /// The function that forwards its argument to the host log.
    pub(crate) fn logger(&self) -> v8::Global<v8::Value> {
        self.logger.clone()
    }

    pub(crate) fn handle_scope(&mut self) -> v8::HandleScope<'_> {
        self.runtime.handle_scope()
    }

    pub(crate) fn thread_safe_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Clear the heap-limit flag before a run.
    pub(crate) fn arm_heap_limit(&self) {
        self.heap_state.triggered.store(false, Ordering::SeqCst);
    }

    pub(crate) fn heap_limit_triggered(&self) -> bool {
        self.heap_state.triggered.load(Ordering::SeqCst)
    }

    /// Let the isolate run JavaScript again after a forced termination.
    pub(crate) fn cancel_termination(&mut self) {
        self.runtime.v8_isolate().cancel_terminate_execution();
    }

    /// Put the heap limit back to the configured size after the callback
    /// extended it, and re-register the callback for the next run.
    pub(crate) fn restore_heap_limit(&mut self) {
        let data = &*self.heap_state as *const HeapLimitState as *mut std::ffi::c_void;
        let isolate = self.runtime.v8_isolate();
        isolate.remove_near_heap_limit_callback(near_heap_limit_callback, self.max_heap_size);
        isolate.add_near_heap_limit_callback(near_heap_limit_callback, data);
    }
}

pub(crate) fn v8_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    text: &str,
) -> Result<v8::Local<'s, v8::String>, SandboxError> {
    v8::String::new(scope, text)
        .ok_or_else(|| SandboxError::engine("string too large for the JS engine"))
}

pub(crate) fn parse_json<'s>(
    scope: &mut v8::HandleScope<'s>,
    json: &str,
) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
    let text = v8_string(scope, json)?;
    v8::json::parse(scope, text)
        .ok_or_else(|| SandboxError::engine("host value could not be materialised"))
}
