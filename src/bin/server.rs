use std::time::Duration;

use clap::Parser;
use rustdis_proxy::config::{self, Config, DEFAULT_PORT};
use rustdis_proxy::{server, Error};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The address to listen on
    #[arg(short, long, env = "PROXY_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// The port to listen on
    #[arg(short, long, env = "PROXY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address of the store to forward commands to, commands are served from memory without it
    #[arg(short, long, env = "PROXY_UPSTREAM")]
    upstream: Option<String>,

    /// Connections kept open to the upstream store
    #[arg(long, env = "PROXY_UPSTREAM_POOL_SIZE", default_value_t = 4)]
    upstream_pool_size: usize,

    /// Reject commands that write
    #[arg(long, env = "PROXY_READ_ONLY")]
    read_only: bool,

    /// Requests a connection may have waiting for a reply, 0 for no limit
    #[arg(long, env = "PROXY_MAX_QUEUED_REQUESTS", default_value_t = 0)]
    max_queued_requests: usize,

    /// Drop requests that waited longer than this many milliseconds, 0 to disable
    #[arg(long, env = "PROXY_TIMEOUT", default_value_t = 0)]
    proxy_timeout: u64,

    /// Largest bulk string accepted from clients, in bytes
    #[arg(long, env = "PROXY_MAX_BULK_LEN", default_value_t = config::Config::default().max_bulk_len)]
    max_bulk_len: usize,

    /// Rename a command, as OLD=NEW. OLD= removes the command. Can be repeated.
    #[arg(long = "rename-command", value_name = "OLD=NEW", value_parser = config::parse_rename)]
    renames: Vec<(String, String)>,

    /// Seconds a closing connection waits for its queued replies
    #[arg(long, env = "PROXY_SHUTDOWN_GRACE", default_value_t = 5)]
    shutdown_grace: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            bind: args.bind,
            port: args.port,
            upstream: args.upstream,
            upstream_pool_size: args.upstream_pool_size.max(1),
            read_only: args.read_only,
            max_queued_requests: args.max_queued_requests,
            proxy_timeout: (args.proxy_timeout > 0).then(|| Duration::from_millis(args.proxy_timeout)),
            max_bulk_len: args.max_bulk_len,
            renames: args.renames,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    server::run(args.into()).await
}
