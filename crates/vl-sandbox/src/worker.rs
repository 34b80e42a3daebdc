//! The thread that owns a sandbox's realm.
//!
//! V8 requires isolates created on one thread to be dropped in reverse
//! creation order, which a host holding several sandboxes cannot promise.
//! Every realm therefore lives on its own thread, is created and dropped
//! there, and is driven through a command channel.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::bindings::BindingRegistry;
use crate::error::SandboxError;
use crate::realm::Realm;
use crate::runner::{self, Binding};
use crate::sandbox::SandboxConfig;

type Reply<T> = mpsc::Sender<Result<T, SandboxError>>;

enum Command {
    Reset(Reply<Vec<String>>),
    ExposeAmbient(String, Reply<()>),
    ExposeValue(String, Value, Reply<()>),
    ExposeUndefined(String, Reply<()>),
    ExposeLogger(String, Reply<()>),
    Run(Option<Map<String, Value>>, Reply<Option<Map<String, Value>>>),
}

/// Host-side handle to a realm thread. Dropping it stops and joins the thread.
pub(crate) struct Worker {
    commands: Option<mpsc::Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the realm thread and wait for the realm to come up. Returns the
    /// global names read right after the bootstrap and prelude.
    pub(crate) fn spawn(
        source: String,
        config: SandboxConfig,
    ) -> Result<(Self, Vec<String>), SandboxError> {
        let (commands, command_rx) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("vl-sandbox".into())
            .spawn(move || {
                let started = Realm::new(&config).and_then(|mut realm| {
                    let names = realm.global_names()?;
                    Ok((realm, names))
                });
                let (realm, names) = match started {
                    Ok(started) => started,
                    Err(e) => {
                        if ready_tx.send(Err(e)).is_err() {
                            tracing::warn!("sandbox creator went away before the realm failed");
                        }
                        return;
                    }
                };

                let mut state = RealmThread {
                    bindings: BindingRegistry::new(),
                    realm,
                    source,
                    timeout: config.timeout,
                };
                state.bindings.reset(names.iter().cloned());
                if ready_tx.send(Ok(names)).is_err() {
                    return;
                }

                for command in command_rx {
                    state.handle(command);
                }
                tracing::trace!("sandbox thread stopping");
            })
            .map_err(|e| SandboxError::engine(format!("could not start sandbox thread: {e}")))?;

        let worker = Self {
            commands: Some(commands),
            thread: Some(thread),
        };
        match ready_rx.recv() {
            Ok(Ok(names)) => Ok((worker, names)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(stopped()),
        }
    }

    pub(crate) fn reset(&self) -> Result<Vec<String>, SandboxError> {
        self.request(Command::Reset)
    }

    pub(crate) fn expose_ambient(&self, name: &str) -> Result<(), SandboxError> {
        self.request(|reply| Command::ExposeAmbient(name.to_string(), reply))
    }

    pub(crate) fn expose_value(&self, name: &str, value: Value) -> Result<(), SandboxError> {
        self.request(|reply| Command::ExposeValue(name.to_string(), value, reply))
    }

    pub(crate) fn expose_undefined(&self, name: &str) -> Result<(), SandboxError> {
        self.request(|reply| Command::ExposeUndefined(name.to_string(), reply))
    }

    pub(crate) fn expose_logger(&self, name: &str) -> Result<(), SandboxError> {
        self.request(|reply| Command::ExposeLogger(name.to_string(), reply))
    }

    /// Run once with `scope` as the receiver; returns the updated scope.
    pub(crate) fn run(
        &self,
        scope: Option<Map<String, Value>>,
    ) -> Result<Option<Map<String, Value>>, SandboxError> {
        self.request(|reply| Command::Run(scope, reply))
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SandboxError> {
        let commands = self.commands.as_ref().ok_or_else(stopped)?;
        let (reply, reply_rx) = mpsc::channel();
        commands.send(command(reply)).map_err(|_| stopped())?;
        reply_rx.recv().map_err(|_| stopped())?
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the channel ends the command loop; the realm is dropped on
        // its own thread before the join returns.
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("sandbox thread panicked");
            }
        }
    }
}

fn stopped() -> SandboxError {
    SandboxError::engine("sandbox thread stopped")
}

/// Everything that has to stay on the realm thread.
struct RealmThread {
    // Holds handles into the realm, so it is declared (and dropped) first.
    bindings: BindingRegistry<Binding>,
    realm: Realm,
    source: String,
    timeout: Option<Duration>,
}

impl RealmThread {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Reset(reply) => respond(reply, self.reset()),
            Command::ExposeAmbient(name, reply) => {
                let result = self.expose_ambient(&name);
                respond(reply, result)
            }
            Command::ExposeValue(name, value, reply) => {
                let result = self
                    .realm
                    .json_value(&value)
                    .map(|binding| self.bindings.expose(&name, binding));
                respond(reply, result)
            }
            Command::ExposeUndefined(name, reply) => {
                let undefined = self.realm.undefined_value();
                self.bindings.expose(&name, undefined);
                respond(reply, Ok(()))
            }
            Command::ExposeLogger(name, reply) => {
                let logger = self.realm.logger();
                self.bindings.expose(&name, logger);
                respond(reply, Ok(()))
            }
            Command::Run(mut scope, reply) => {
                let result = runner::run(
                    &mut self.realm,
                    &self.source,
                    &self.bindings,
                    scope.as_mut(),
                    self.timeout,
                )
                .map(|()| scope);
                respond(reply, result)
            }
        }
    }

    fn reset(&mut self) -> Result<Vec<String>, SandboxError> {
        let names = self.realm.global_names()?;
        self.bindings.reset(names.iter().cloned());
        Ok(names)
    }

    fn expose_ambient(&mut self, name: &str) -> Result<(), SandboxError> {
        match self.realm.lookup_global(name)? {
            Some(value) => {
                self.bindings.expose(name, value);
                Ok(())
            }
            None => Err(SandboxError::UnknownGlobal {
                name: name.to_string(),
            }),
        }
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T, SandboxError>) {
    if reply.send(result).is_err() {
        tracing::debug!("sandbox reply dropped by the host");
    }
}
