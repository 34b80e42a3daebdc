#![warn(missing_docs)]

//! # vl-sandbox
//!
//! Runs an untrusted JavaScript snippet in a deno_core realm where every
//! ambient global is shadowed. The snippet can only reach the names the host
//! exposes; every other global identifier evaluates to `null`.
//!
//! ## Security model
//!
//! - **Screening**: the source is checked once, before any isolate exists.
//!   Conventional `function`s are rejected because, called without a
//!   receiver, they see the global object as `this`. Arrow functions are fine.
//! - **Shadowing**: each run compiles the source as the body of a function
//!   whose parameters are all global names plus the exposed names, so lookups
//!   never reach the global object.
//! - **Explicit exposure**: ambient values are handed in only through
//!   [`Sandbox::expose_ambient`]; host values through [`Sandbox::expose_value`].
//!
//! Each sandbox keeps its V8 isolate on a thread of its own, so a host can
//! hold any number of sandboxes and drop them in any order.
//!
//! Constructor-chain escapes and prototype pollution are out of scope.
//!
//! ## Example
//!
//! ```no_run
//! use vl_sandbox::Sandbox;
//!
//! let mut sandbox = Sandbox::new("this.total = Math.max(a, b)")?;
//! sandbox.expose_ambient("Math")?;
//! sandbox.expose_value("a", 3.into())?;
//! sandbox.expose_value("b", 7.into())?;
//!
//! let mut scope = serde_json::Map::new();
//! sandbox.run(Some(&mut scope))?;
//! assert_eq!(scope["total"], 7);
//! # Ok::<(), vl_sandbox::SandboxError>(())
//! ```

pub mod bindings;
pub mod error;
pub mod ops;
mod realm;
mod runner;
pub mod sandbox;
pub mod screener;
mod worker;

pub use error::{JsException, SandboxError};
pub use sandbox::{Sandbox, SandboxConfig};
