use std::panic::{self, AssertUnwindSafe};
use std::str;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use thiserror::Error as ThisError;
use tracing::{debug, error};

use crate::codec::parse_integer;
use crate::connection::ConnectionHandle;
use crate::context::{self, Current};
use crate::deferred::panic_message;
use crate::proxy::Proxy;
use crate::registry::{Descriptor, Kind, Registry, RegistryError, Shape};
use crate::reply::Reply;
use crate::request::Request;

pub const READ_ONLY_ERROR: &str = "READONLY You can't write against a read only proxy.";

/// Turns requests into replies by way of the command registry.
pub struct Dispatcher {
    registry: RwLock<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Dispatcher {
        Dispatcher {
            registry: RwLock::new(registry),
        }
    }

    /// Runs the handler bound to the verb of `request`.
    ///
    /// Never fails: unknown verbs, arguments that do not fit the handler signature, writes while
    /// the proxy is read-only, handler errors and handler panics all become error replies.
    pub fn dispatch(
        &self,
        proxy: &Arc<Proxy>,
        request: &Arc<Request>,
        connection: &ConnectionHandle,
    ) -> Reply {
        let _dispatch = request.lifecycle().dispatch();

        let Some(verb) = request.verb() else {
            return Reply::error("ERR unknown command ''");
        };

        let mut name = verb.to_vec();
        let Some(descriptor) = self.registry().lookup(&mut name) else {
            debug!("Unknown command {:?}", String::from_utf8_lossy(verb));
            return Reply::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(verb)
            ));
        };

        if descriptor.kind() == Kind::Write && proxy.settings().read_only() {
            return Reply::error(READ_ONLY_ERROR);
        }

        connection.set_last_command(descriptor.name());

        let args = match Args::bind(&descriptor, request.args()) {
            Ok(args) => args,
            Err(err) => return Reply::from_error(&err),
        };

        let current = Current {
            request: request.clone(),
            connection: connection.clone(),
        };
        let handler = descriptor.handler();
        let result = context::scope(current, || {
            panic::catch_unwind(AssertUnwindSafe(|| handler(proxy, args)))
        });

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                debug!("{} failed: {}", descriptor.name(), err);
                Reply::from_error(err.as_ref())
            }
            Err(panic) => {
                error!("{} panicked: {}", descriptor.name(), panic_message(&*panic));
                Reply::error(format!(
                    "ERR internal error while running '{}'",
                    descriptor.name().to_ascii_lowercase()
                ))
            }
        }
    }

    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, descriptor: Descriptor) -> Result<(), RegistryError> {
        self.registry_mut().register(descriptor)
    }

    pub fn unregister(&self, verb: &str) -> Result<(), RegistryError> {
        self.registry_mut().unregister(verb).map(|_| ())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), RegistryError> {
        self.registry_mut().rename(old, new)
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ArgError {
    #[error("wrong number of arguments for '{command}' command")]
    WrongArity { command: String },
    #[error("value is not an integer or out of range")]
    NotInteger,
    #[error("syntax error")]
    Syntax,
    #[error("invalid UTF-8 string")]
    InvalidUtf8(#[from] str::Utf8Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Single(Option<Bytes>),
    Rest(Vec<Bytes>),
}

/// Request tokens bound to the parameters of a handler, by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    command: String,
    values: Vec<Arg>,
}

impl Args {
    /// Binds `tokens` to the parameters of `descriptor`. A rest parameter takes every remaining
    /// token and parameters past the last token are left absent; tokens beyond the last parameter
    /// are an arity error.
    pub fn bind(descriptor: &Descriptor, tokens: &[Bytes]) -> Result<Args, ArgError> {
        let command = descriptor.name().to_ascii_lowercase();
        let mut tokens = tokens.iter().cloned();

        let values = descriptor
            .params()
            .iter()
            .map(|param| match param.shape {
                Shape::Single => Arg::Single(tokens.next()),
                Shape::Rest => Arg::Rest(tokens.by_ref().collect()),
            })
            .collect();

        if tokens.next().is_some() {
            return Err(ArgError::WrongArity { command });
        }

        Ok(Args { command, values })
    }

    /// The lower-cased name of the command the arguments were bound for.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn optional(&self, index: usize) -> Option<&Bytes> {
        match self.values.get(index) {
            Some(Arg::Single(value)) => value.as_ref(),
            _ => None,
        }
    }

    /// The token bound to parameter `index`, which must be there.
    pub fn bytes(&self, index: usize) -> Result<Bytes, ArgError> {
        self.optional(index)
            .cloned()
            .ok_or_else(|| self.wrong_arity())
    }

    pub fn string(&self, index: usize) -> Result<String, ArgError> {
        let bytes = self.bytes(index)?;
        Ok(str::from_utf8(&bytes)?.to_string())
    }

    pub fn integer(&self, index: usize) -> Result<i64, ArgError> {
        parse_integer(&self.bytes(index)?).ok_or(ArgError::NotInteger)
    }

    /// The tokens bound to rest parameter `index`, empty when there were none.
    pub fn rest(&self, index: usize) -> &[Bytes] {
        match self.values.get(index) {
            Some(Arg::Rest(values)) => values,
            _ => &[],
        }
    }

    /// Like [`Args::rest`], but at least one token is required.
    pub fn non_empty_rest(&self, index: usize) -> Result<Vec<Bytes>, ArgError> {
        match self.rest(index) {
            [] => Err(self.wrong_arity()),
            values => Ok(values.to_vec()),
        }
    }

    pub fn wrong_arity(&self) -> ArgError {
        ArgError::WrongArity {
            command: self.command.clone(),
        }
    }
}
