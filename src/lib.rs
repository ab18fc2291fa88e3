pub mod backend;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod context;
pub mod deferred;
pub mod dispatch;
pub mod frame;
pub mod pool;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod reply;
pub mod request;
pub mod server;
pub mod store;

#[cfg(test)]
mod testing;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
