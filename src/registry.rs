use std::fmt;
use std::sync::Arc;

use strum_macros::{AsRefStr, Display};
use thiserror::Error as ThisError;

use crate::dispatch::Args;
use crate::proxy::Proxy;
use crate::reply::Reply;
use crate::Error;

const BUCKETS: usize = 26;

/// The function a verb is bound to. It gets the arguments already bound to its signature and
/// either returns a reply, possibly deferred, or fails.
pub type Handler = fn(&Arc<Proxy>, Args) -> Result<Reply, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Read,
    Write,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// One token, absent when the request ran out of tokens.
    Single,
    /// Every remaining token.
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub shape: Shape,
}

/// A registry entry, binding a verb to its handler.
///
/// The signature lists the handler parameters separated by whitespace: `key` takes a single token
/// and `keys...` takes all the remaining ones. It is checked when the descriptor is registered.
#[derive(Clone)]
pub struct Descriptor {
    name: String,
    kind: Kind,
    signature: &'static str,
    params: Vec<Param>,
    handler: Handler,
}

impl Descriptor {
    pub fn new(name: &str, kind: Kind, signature: &'static str, handler: Handler) -> Descriptor {
        Descriptor {
            name: name.to_ascii_uppercase(),
            kind,
            signature,
            params: Vec::new(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn signature(&self) -> &'static str {
        self.signature
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn handler(&self) -> Handler {
        self.handler
    }

    fn renamed(&self, name: &str) -> Descriptor {
        Descriptor {
            name: name.to_ascii_uppercase(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("signature", &self.signature)
            .finish()
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command '{0}' is already registered")]
    Duplicate(String),
    #[error("command '{0}' is not registered")]
    NotFound(String),
    #[error("invalid command name '{0}', names must start with a letter")]
    InvalidName(String),
    #[error("handler '{handler}' declares an invalid parameter '{param}'")]
    InvalidParameter { handler: String, param: String },
    #[error("handler '{handler}' declares rest parameter '{param}' before its last parameter")]
    MisplacedRest { handler: String, param: String },
}

/// Verb to descriptor mapping. Verbs are case-insensitive, stored upper-cased and bucketed by
/// their first letter.
pub struct Registry {
    buckets: [Vec<Arc<Descriptor>>; BUCKETS],
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            buckets: Default::default(),
        }
    }

    /// Finds the descriptor of `verb`.
    ///
    /// The buffer is upper-cased in place, callers that need the original spelling must keep a
    /// copy.
    pub fn lookup(&self, verb: &mut [u8]) -> Option<Arc<Descriptor>> {
        verb.make_ascii_uppercase();

        let bucket = bucket(verb.first().copied()?)?;
        self.buckets[bucket]
            .iter()
            .find(|descriptor| descriptor.name.as_bytes() == verb)
            .cloned()
    }

    pub fn register(&mut self, mut descriptor: Descriptor) -> Result<(), RegistryError> {
        descriptor.params = parse_signature(&descriptor.name, descriptor.signature)?;
        self.insert(descriptor)
    }

    pub fn unregister(&mut self, verb: &str) -> Result<Arc<Descriptor>, RegistryError> {
        let name = verb.to_ascii_uppercase();
        let entries = bucket(name.bytes().next().unwrap_or_default())
            .map(|bucket| &mut self.buckets[bucket])
            .ok_or_else(|| RegistryError::NotFound(name.clone()))?;

        let position = entries
            .iter()
            .position(|descriptor| descriptor.name == name)
            .ok_or(RegistryError::NotFound(name))?;

        Ok(entries.remove(position))
    }

    /// Moves the descriptor of `old` to `new`. A blank `new` removes the verb. When `new` is taken
    /// the registry is left untouched.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), RegistryError> {
        let new = new.trim();
        if new.is_empty() {
            return self.unregister(old).map(|_| ());
        }

        let mut upper = old.to_ascii_uppercase().into_bytes();
        let current = self
            .lookup(&mut upper)
            .ok_or_else(|| RegistryError::NotFound(old.to_ascii_uppercase()))?;

        let renamed = current.renamed(new);
        if renamed.name == current.name {
            return Ok(());
        }
        if self.lookup(&mut new.as_bytes().to_vec()).is_some() {
            return Err(RegistryError::Duplicate(renamed.name));
        }
        if bucket(renamed.name.bytes().next().unwrap_or_default()).is_none() {
            return Err(RegistryError::InvalidName(renamed.name));
        }

        self.unregister(old)?;
        self.insert(renamed)
    }

    /// The registered verbs, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .iter()
            .flatten()
            .map(|descriptor| descriptor.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, descriptor: Descriptor) -> Result<(), RegistryError> {
        let Some(bucket) = bucket(descriptor.name.bytes().next().unwrap_or_default()) else {
            return Err(RegistryError::InvalidName(descriptor.name));
        };

        let entries = &mut self.buckets[bucket];
        if entries.iter().any(|existing| existing.name == descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }

        entries.push(Arc::new(descriptor));
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket(first: u8) -> Option<usize> {
    first
        .is_ascii_alphabetic()
        .then(|| (first.to_ascii_uppercase() - b'A') as usize)
}

fn parse_signature(handler: &str, signature: &str) -> Result<Vec<Param>, RegistryError> {
    let mut params: Vec<Param> = Vec::new();

    for token in signature.split_whitespace() {
        if let Some(previous) = params.last() {
            if previous.shape == Shape::Rest {
                return Err(RegistryError::MisplacedRest {
                    handler: handler.to_string(),
                    param: format!("{}...", previous.name),
                });
            }
        }

        let (name, shape) = match token.strip_suffix("...") {
            Some(name) => (name, Shape::Rest),
            None => (token, Shape::Single),
        };

        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(RegistryError::InvalidParameter {
                handler: handler.to_string(),
                param: token.to_string(),
            });
        }

        params.push(Param {
            name: name.to_string(),
            shape,
        });
    }

    Ok(params)
}
