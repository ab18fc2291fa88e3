use std::sync::Arc;

use crate::context;
use crate::dispatch::Args;
use crate::proxy::Proxy;
use crate::registry::{Descriptor, Kind};
use crate::reply::Reply;
use crate::Error;

pub fn descriptors() -> Vec<Descriptor> {
    vec![
        Descriptor::new("PING", Kind::Other, "message", ping),
        Descriptor::new("ECHO", Kind::Other, "message", echo),
        Descriptor::new("QUIT", Kind::Other, "", quit),
    ]
}

// https://redis.io/commands/ping
fn ping(_proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    match args.optional(0) {
        Some(message) => Ok(Reply::bulk(message.clone())),
        None => Ok(Reply::status("PONG")),
    }
}

// https://redis.io/commands/echo
fn echo(_proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    Ok(Reply::bulk(args.bytes(0)?))
}

// https://redis.io/commands/quit
fn quit(_proxy: &Arc<Proxy>, _args: Args) -> Result<Reply, Error> {
    if let Some(connection) = context::connection() {
        connection.close_after_reply();
    }
    Ok(Reply::ok())
}
