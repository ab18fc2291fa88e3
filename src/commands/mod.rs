pub mod admin;
pub mod connection;
pub mod keys;
pub mod strings;

use std::time::Duration;

use tokio::time::Instant;

use crate::registry::Descriptor;
use crate::Error;

/// Every command the proxy serves out of the box.
pub fn descriptors() -> Vec<Descriptor> {
    let mut descriptors = Vec::new();
    descriptors.extend(connection::descriptors());
    descriptors.extend(strings::descriptors());
    descriptors.extend(keys::descriptors());
    descriptors.extend(admin::descriptors());
    descriptors
}

/// Rejects relative expire times of `command` too far out to become a deadline.
pub(crate) fn expire_time(command: &str, ttl: Duration) -> Result<Duration, Error> {
    match Instant::now().checked_add(ttl) {
        Some(_) => Ok(ttl),
        None => Err(invalid_expire_time(command)),
    }
}

pub(crate) fn invalid_expire_time(command: &str) -> Error {
    format!("ERR invalid expire time in '{}' command", command).into()
}
