//! deno_core op definitions for the sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use deno_core::op2;

/// Log target for messages written by snippet code.
pub const JS_LOG_TARGET: &str = "vl::sandbox::js";

/// Log a message from snippet code through the host's tracing subscriber.
#[op2(fast)]
pub fn op_vl_log(#[string] msg: &str) {
    tracing::info!(target: JS_LOG_TARGET, "{}", msg);
}

deno_core::extension!(sandbox_ext, ops = [op_vl_log]);
