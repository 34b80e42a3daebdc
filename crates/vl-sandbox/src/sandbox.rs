//! The sandbox: screened source, binding table and realm.
//!
//! The realm runs on a thread owned by the [`Sandbox`], so sandboxes can be
//! created, moved and dropped in any order. The host keeps a mirror of the
//! binding names for the accessors.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::bindings::BindingRegistry;
use crate::error::SandboxError;
use crate::screener;
use crate::worker::Worker;

/// Configuration for a sandbox instance. Fixed at construction.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Accept `function*` generators during screening.
    pub allow_generator_functions: bool,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Terminate a run after this long. `None` lets a run block forever.
    pub timeout: Option<Duration>,
    /// Trusted script evaluated in the realm before the first reset. Globals
    /// it defines become part of the ambient environment.
    pub prelude: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allow_generator_functions: false,
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            timeout: None,
            prelude: None,
        }
    }
}

/// An untrusted snippet plus the bindings it may see.
///
/// ```no_run
/// use vl_sandbox::{Sandbox, SandboxError};
///
/// let mut sandbox = Sandbox::new("this.seen = typeof JSON")?;
/// let mut scope = serde_json::Map::new();
/// sandbox.run(Some(&mut scope))?;
/// // JSON is shadowed with null, and typeof null is "object".
/// assert_eq!(scope["seen"], "object");
/// # Ok::<(), SandboxError>(())
/// ```
pub struct Sandbox {
    names: BindingRegistry<()>,
    worker: Worker,
    source: String,
    config: SandboxConfig,
}

impl Sandbox {
    /// Screen `source` with generator functions disallowed and set up a realm.
    pub fn new(source: impl Into<String>) -> Result<Self, SandboxError> {
        Self::with_config(source, SandboxConfig::default())
    }

    /// Screen `source` under `config` and set up a realm.
    ///
    /// Screening happens before any isolate is created; a rejected source
    /// never returns a sandbox.
    pub fn with_config(
        source: impl Into<String>,
        config: SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let source = source.into();
        screener::screen(&source, config.allow_generator_functions)?;

        let (worker, globals) = Worker::spawn(source.clone(), config.clone())?;
        let mut names = BindingRegistry::new();
        names.reset(globals);
        let sandbox = Self {
            names,
            worker,
            source,
            config,
        };

        tracing::debug!(
            source_len = sandbox.source.len(),
            shadowed = sandbox.names.globals().len(),
            "sandbox created"
        );
        Ok(sandbox)
    }

    /// Re-read the global names from the realm and drop every exposure.
    pub fn reset(&mut self) -> Result<(), SandboxError> {
        let globals = self.worker.reset()?;
        self.names.reset(globals);
        Ok(())
    }

    /// Expose the realm's current value of `name` under the same name.
    ///
    /// Fails with [`SandboxError::UnknownGlobal`] when `name in globalThis` is
    /// false; use [`Sandbox::expose_value`] for such names.
    pub fn expose_ambient(&mut self, name: &str) -> Result<(), SandboxError> {
        self.worker.expose_ambient(name)?;
        self.names.expose(name, ());
        tracing::debug!(name, "exposed ambient global");
        Ok(())
    }

    /// Bind `name` to a host value, whether or not it is an ambient global.
    ///
    /// The value is materialised once. Runs share that object, so changes a
    /// snippet makes to it are visible to later runs until the name is
    /// exposed again or the sandbox is reset.
    pub fn expose_value(&mut self, name: &str, value: Value) -> Result<(), SandboxError> {
        self.worker.expose_value(name, value)?;
        self.names.expose(name, ());
        tracing::debug!(name, "exposed host value");
        Ok(())
    }

    /// Bind `name` to `undefined`.
    pub fn expose_undefined(&mut self, name: &str) -> Result<(), SandboxError> {
        self.worker.expose_undefined(name)?;
        self.names.expose(name, ());
        tracing::debug!(name, "exposed undefined");
        Ok(())
    }

    /// Bind `name` to a function that writes its argument to the host log
    /// (tracing target [`crate::ops::JS_LOG_TARGET`]).
    pub fn expose_logger(&mut self, name: &str) -> Result<(), SandboxError> {
        self.worker.expose_logger(name)?;
        self.names.expose(name, ());
        tracing::debug!(name, "exposed logger");
        Ok(())
    }

    /// Run the snippet once.
    ///
    /// `this` is `scope` when given, else a fresh empty object. After a
    /// successful run the receiver is serialised back into `scope` (members
    /// JSON cannot represent are dropped). The snippet's return value is
    /// discarded.
    pub fn run(&mut self, scope: Option<&mut Map<String, Value>>) -> Result<(), SandboxError> {
        match scope {
            Some(map) => {
                if let Some(updated) = self.worker.run(Some(map.clone()))? {
                    *map = updated;
                }
            }
            None => {
                self.worker.run(None)?;
            }
        }
        Ok(())
    }

    /// The screened source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether generator functions were allowed at construction.
    pub fn allows_generator_functions(&self) -> bool {
        self.config.allow_generator_functions
    }

    /// Names currently shadowed with `null`.
    pub fn global_names(&self) -> &[String] {
        self.names.globals()
    }

    /// Names currently exposed, in exposure order.
    pub fn exposed_names(&self) -> impl Iterator<Item = &str> {
        self.names.exposed_names()
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("shadowed", &self.names.globals().len())
            .field("exposed", &self.names.exposed_names().collect::<Vec<_>>())
            .finish()
    }
}
