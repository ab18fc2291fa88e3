use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use glob_match::glob_match;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, EnumIter, EnumString, IntoStaticStr};
use thiserror::Error as ThisError;

use crate::codec::{MAX_BULK_LEN, MAX_MULTIBULK_LEN};

pub const DEFAULT_PORT: u16 = 6379;

/// Startup configuration of the proxy.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// Address of the store to forward to. Without one, requests are served from memory.
    pub upstream: Option<String>,
    pub upstream_pool_size: usize,
    pub read_only: bool,
    /// Per connection limit of requests waiting for their reply, 0 for no limit.
    pub max_queued_requests: usize,
    /// Requests older than this when their dispatch starts are dropped without a reply.
    /// Age is counted from decode and dispatch starts right after it on the reading task,
    /// so this only fires when a lazy reply computed on that task stalls the reader.
    /// It does not bound how long the backend takes to answer.
    pub proxy_timeout: Option<Duration>,
    pub max_bulk_len: usize,
    pub max_multibulk_len: usize,
    /// Verb renames applied before serving, an empty new name removes the verb.
    pub renames: Vec<(String, String)>,
    pub lazy_pool_size: usize,
    /// How long a closing connection waits for its queued replies.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            upstream: None,
            upstream_pool_size: 4,
            read_only: false,
            max_queued_requests: 0,
            proxy_timeout: None,
            max_bulk_len: MAX_BULK_LEN,
            max_multibulk_len: MAX_MULTIBULK_LEN,
            renames: Vec::new(),
            lazy_pool_size: 1,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown option or number of arguments for CONFIG SET - '{0}'")]
    UnknownParameter(String),
    #[error("Invalid argument '{value}' for CONFIG SET '{parameter}'")]
    InvalidValue { parameter: String, value: String },
    #[error("invalid rename '{0}', expected OLD=NEW")]
    InvalidRename(String),
}

/// The settings that can be changed at runtime with `CONFIG SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumIter, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Parameter {
    ProxyTimeout,
    MaxQueuedRequests,
    ReadOnly,
}

/// Runtime settings, shared by every connection.
#[derive(Debug)]
pub struct Settings {
    read_only: AtomicBool,
    max_queued_requests: AtomicUsize,
    // In milliseconds, 0 when disabled.
    proxy_timeout: AtomicU64,
}

impl Settings {
    pub fn new(config: &Config) -> Settings {
        let timeout = config
            .proxy_timeout
            .map_or(0, |timeout| timeout.as_millis().min(u64::MAX as u128) as u64);

        Settings {
            read_only: AtomicBool::new(config.read_only),
            max_queued_requests: AtomicUsize::new(config.max_queued_requests),
            proxy_timeout: AtomicU64::new(timeout),
        }
    }

    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    pub fn max_queued_requests(&self) -> usize {
        self.max_queued_requests.load(Ordering::Relaxed)
    }

    pub fn proxy_timeout(&self) -> Option<Duration> {
        match self.proxy_timeout.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    pub fn get(&self, parameter: Parameter) -> String {
        match parameter {
            Parameter::ProxyTimeout => self.proxy_timeout.load(Ordering::Relaxed).to_string(),
            Parameter::MaxQueuedRequests => self.max_queued_requests().to_string(),
            Parameter::ReadOnly => yes_no(self.read_only()).to_string(),
        }
    }

    /// Name and value of every parameter whose name matches the glob `pattern`.
    pub fn matching(&self, pattern: &str) -> Vec<(&'static str, String)> {
        let pattern = pattern.to_ascii_lowercase();
        Parameter::iter()
            .filter(|parameter| glob_match(&pattern, parameter.as_ref()))
            .map(|parameter| (parameter.into(), self.get(parameter)))
            .collect()
    }

    pub fn set(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        self.set_all([(name, value)])
    }

    /// Applies every `(name, value)` pair, or none of them when one is invalid.
    pub fn set_all<'a>(
        &self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), ConfigError> {
        let updates = pairs
            .into_iter()
            .map(|(name, value)| Update::parse(name, value))
            .collect::<Result<Vec<_>, _>>()?;

        for update in updates {
            match update {
                Update::ProxyTimeout(millis) => self.proxy_timeout.store(millis, Ordering::Relaxed),
                Update::MaxQueuedRequests(max) => {
                    self.max_queued_requests.store(max, Ordering::Relaxed)
                }
                Update::ReadOnly(read_only) => self.set_read_only(read_only),
            }
        }

        Ok(())
    }
}

/// A parsed `CONFIG SET` value.
enum Update {
    ProxyTimeout(u64),
    MaxQueuedRequests(usize),
    ReadOnly(bool),
}

impl Update {
    fn parse(name: &str, value: &str) -> Result<Update, ConfigError> {
        let parameter = Parameter::from_str(name)
            .map_err(|_| ConfigError::UnknownParameter(name.to_string()))?;
        let invalid = || ConfigError::InvalidValue {
            parameter: parameter.as_ref().to_string(),
            value: value.to_string(),
        };

        match parameter {
            Parameter::ProxyTimeout => value
                .parse()
                .map(Update::ProxyTimeout)
                .map_err(|_| invalid()),
            Parameter::MaxQueuedRequests => value
                .parse()
                .map(Update::MaxQueuedRequests)
                .map_err(|_| invalid()),
            Parameter::ReadOnly => parse_bool(value).map(Update::ReadOnly).ok_or_else(invalid),
        }
    }
}

/// Parses an `OLD=NEW` verb rename. `OLD=` removes the verb.
pub fn parse_rename(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('=') {
        Some((old, new)) if !old.trim().is_empty() => {
            Ok((old.trim().to_string(), new.trim().to_string()))
        }
        _ => Err(ConfigError::InvalidRename(s.to_string())),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_names() {
        assert_eq!(Parameter::ProxyTimeout.as_ref(), "proxy-timeout");
        assert_eq!(
            Parameter::from_str("MAX-QUEUED-REQUESTS"),
            Ok(Parameter::MaxQueuedRequests)
        );
        assert!(Parameter::from_str("maxmemory").is_err());
    }

    #[test]
    fn settings_from_config() {
        let settings = Settings::new(&Config {
            read_only: true,
            max_queued_requests: 10,
            proxy_timeout: Some(Duration::from_millis(250)),
            ..Config::default()
        });

        assert!(settings.read_only());
        assert_eq!(settings.max_queued_requests(), 10);
        assert_eq!(settings.proxy_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn set_and_get() {
        let settings = Settings::new(&Config::default());

        settings.set("proxy-timeout", "100").unwrap();
        settings.set("Read-Only", "yes").unwrap();
        settings.set("max-queued-requests", "3").unwrap();

        assert_eq!(settings.get(Parameter::ProxyTimeout), "100");
        assert_eq!(settings.get(Parameter::ReadOnly), "yes");
        assert_eq!(settings.max_queued_requests(), 3);

        settings.set("proxy-timeout", "0").unwrap();
        assert_eq!(settings.proxy_timeout(), None);
    }

    #[test]
    fn set_rejects_bad_input() {
        let settings = Settings::new(&Config::default());

        assert_eq!(
            settings.set("maxmemory", "1"),
            Err(ConfigError::UnknownParameter("maxmemory".to_string()))
        );
        assert_eq!(
            settings.set("read-only", "maybe"),
            Err(ConfigError::InvalidValue {
                parameter: "read-only".to_string(),
                value: "maybe".to_string()
            })
        );
        assert!(settings.set("proxy-timeout", "-1").is_err());
    }

    #[test]
    fn set_all_applies_nothing_on_error() {
        let settings = Settings::new(&Config::default());

        assert_eq!(
            settings.set_all([("proxy-timeout", "100"), ("read-only", "maybe")]),
            Err(ConfigError::InvalidValue {
                parameter: "read-only".to_string(),
                value: "maybe".to_string()
            })
        );
        assert_eq!(settings.proxy_timeout(), None);
        assert!(!settings.read_only());

        settings
            .set_all([("proxy-timeout", "100"), ("read-only", "yes")])
            .unwrap();
        assert_eq!(settings.proxy_timeout(), Some(Duration::from_millis(100)));
        assert!(settings.read_only());
    }

    #[test]
    fn matching_patterns() {
        let settings = Settings::new(&Config::default());

        assert_eq!(settings.matching("*").len(), 3);
        assert_eq!(
            settings.matching("read-*"),
            vec![("read-only", "no".to_string())]
        );
        assert!(settings.matching("nothing").is_empty());
    }

    #[test]
    fn renames() {
        assert_eq!(
            parse_rename("FLUSHDB=WIPE"),
            Ok(("FLUSHDB".to_string(), "WIPE".to_string()))
        );
        assert_eq!(
            parse_rename("KEYS="),
            Ok(("KEYS".to_string(), "".to_string()))
        );
        assert!(parse_rename("KEYS").is_err());
        assert!(parse_rename("=KEYS").is_err());
    }
}
