//! Error types for the sandbox.

use thiserror::Error;

/// Where to read about rewriting conventional functions as arrow functions.
pub const ARROW_FUNCTION_GUIDE: &str =
    "https://github.com/vlvtin/vlsandbox/blob/master/doc/functions.md";

/// Errors that can occur while building, configuring or running a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The screener found a `function` keyword. No sandbox is returned.
    #[error(
        "unsafe sandbox input: {} at byte {offset}. Convert conventional functions to arrow functions. Guide: {}",
        construct_label(.generator),
        ARROW_FUNCTION_GUIDE
    )]
    UnsafeInput {
        /// Byte offset of the offending keyword in the source.
        offset: usize,
        /// Whether the rejected function was a generator.
        generator: bool,
    },

    /// Brackets nest too deeply to screen safely. No sandbox is returned.
    #[error("unsafe sandbox input: nesting depth {actual} exceeds maximum {max}")]
    NestingTooDeep {
        /// Deepest nesting accepted.
        max: usize,
        /// Deepest nesting found in the source.
        actual: usize,
    },

    /// `expose_ambient` was called with a name the realm does not define.
    #[error("can't expose `{name}` automatically because it is not defined on globalThis; expose it with an explicit value instead")]
    UnknownGlobal {
        /// The requested name.
        name: String,
    },

    /// The source could not be compiled as a function body.
    #[error("sandbox source failed to compile: {message}")]
    Compile {
        /// The engine's syntax error message.
        message: String,
    },

    /// The snippet threw while running.
    #[error("{0}")]
    Snippet(JsException),

    /// Execution ran past the configured deadline and was terminated.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// The configured prelude script failed.
    #[error("sandbox prelude failed: {message}")]
    Prelude {
        /// The error reported by the engine.
        message: String,
    },

    /// Moving a value between the host and the realm failed.
    #[error("sandbox engine error: {message}")]
    Engine {
        /// What went wrong.
        message: String,
    },
}

fn construct_label(generator: &bool) -> &'static str {
    if *generator {
        "generator function (generator functions are disabled)"
    } else {
        "`function` declaration or expression"
    }
}

impl SandboxError {
    pub(crate) fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }
}

/// A value thrown by snippet code, as the engine reported it.
///
/// For `Error` objects `name`, `message` and `stack` are the object's own
/// properties. For any other thrown value `name` and `stack` are `None` and
/// `message` is the value's string conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsException {
    /// The error's `name` property (`"Error"`, `"TypeError"`, ...).
    pub name: Option<String>,
    /// The error's `message` property.
    pub message: String,
    /// The error's `stack` property.
    pub stack: Option<String>,
}

impl std::fmt::Display for JsException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.message),
            None => write!(f, "uncaught {}", self.message),
        }
    }
}
