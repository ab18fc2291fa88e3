use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use itertools::Itertools;

use crate::context;
use crate::dispatch::Args;
use crate::proxy::Proxy;
use crate::registry::{Descriptor, Kind};
use crate::reply::Reply;
use crate::Error;

pub fn descriptors() -> Vec<Descriptor> {
    vec![
        Descriptor::new("CONFIG", Kind::Other, "subcommand args...", config),
        Descriptor::new("CLIENT", Kind::Other, "subcommand args...", client),
        Descriptor::new("INFO", Kind::Other, "section", info),
        Descriptor::new("COMMAND", Kind::Other, "subcommand args...", command),
    ]
}

// https://redis.io/commands/config-get
// https://redis.io/commands/config-set
fn config(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let subcommand = args.string(0)?.to_ascii_uppercase();
    let rest = args.rest(1);

    match subcommand.as_str() {
        "GET" => {
            let [pattern] = rest else {
                return Err(subcommand_arity("config", "get"));
            };

            let settings = proxy.settings();
            let items = settings
                .matching(&String::from_utf8_lossy(pattern))
                .into_iter()
                .flat_map(|(name, value)| [Reply::bulk(name), Reply::bulk(value)])
                .collect();
            Ok(Reply::array(items))
        }
        "SET" => {
            if rest.is_empty() || rest.len() % 2 != 0 {
                return Err(subcommand_arity("config", "set"));
            }

            let pairs: Vec<(String, String)> = rest
                .iter()
                .map(|token| String::from_utf8_lossy(token).into_owned())
                .tuples()
                .collect();
            proxy
                .settings()
                .set_all(pairs.iter().map(|(name, value)| (name.as_str(), value.as_str())))?;
            Ok(Reply::ok())
        }
        _ => Err(unknown_subcommand("CONFIG", &subcommand)),
    }
}

// https://redis.io/commands/client-list
fn client(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let subcommand = args.string(0)?.to_ascii_uppercase();
    let rest = args.rest(1);
    let connection = context::connection().ok_or("ERR no client connection")?;

    match (subcommand.as_str(), rest) {
        ("LIST", []) => {
            let proxy = Arc::clone(proxy);
            Ok(Reply::lazy(move || Reply::bulk(proxy.clients().render())))
        }
        ("ID", []) => Ok(Reply::integer(connection.id() as i64)),
        ("GETNAME", []) => Ok(match connection.name() {
            Some(name) => Reply::bulk(name),
            None => Reply::null(),
        }),
        ("SETNAME", [name]) => {
            let name = std::str::from_utf8(name)?;
            if name.bytes().any(|b| !b.is_ascii_graphic()) {
                return Err(
                    "ERR Client names cannot contain spaces, newlines or special characters."
                        .into(),
                );
            }

            connection.set_name((!name.is_empty()).then(|| name.to_string()));
            Ok(Reply::ok())
        }
        ("SETINFO", [attribute, value]) => {
            let value = String::from_utf8_lossy(value).to_string();
            match attribute.to_ascii_uppercase().as_slice() {
                b"LIB-NAME" => connection.set_lib_name(value),
                b"LIB-VER" => connection.set_lib_version(value),
                _ => {
                    return Err(format!(
                        "ERR Unrecognized option '{}'",
                        String::from_utf8_lossy(attribute)
                    )
                    .into())
                }
            }
            Ok(Reply::ok())
        }
        ("LIST" | "ID" | "GETNAME" | "SETNAME" | "SETINFO", _) => {
            Err(subcommand_arity("client", &subcommand.to_ascii_lowercase()))
        }
        _ => Err(unknown_subcommand("CLIENT", &subcommand)),
    }
}

// https://redis.io/commands/info
fn info(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let section = args
        .optional(0)
        .map(|section| String::from_utf8_lossy(section).to_ascii_lowercase());
    let proxy = Arc::clone(proxy);

    Ok(Reply::lazy(move || {
        Reply::bulk(render_info(&proxy, section.as_deref()))
    }))
}

fn render_info(proxy: &Proxy, section: Option<&str>) -> String {
    let stats = proxy.stats();
    let settings = proxy.settings();

    let sections = [
        (
            "server",
            vec![
                ("proxy_version", env!("CARGO_PKG_VERSION").to_string()),
                ("backend", proxy.backend().name().to_string()),
                ("process_id", std::process::id().to_string()),
                ("uptime_in_seconds", proxy.uptime().as_secs().to_string()),
            ],
        ),
        (
            "clients",
            vec![("connected_clients", proxy.clients().len().to_string())],
        ),
        (
            "stats",
            vec![
                (
                    "total_connections_received",
                    stats.connections_received.load(Ordering::Relaxed).to_string(),
                ),
                (
                    "total_commands_processed",
                    stats.commands_processed.load(Ordering::Relaxed).to_string(),
                ),
                (
                    "rejected_busy",
                    stats.rejected_busy.load(Ordering::Relaxed).to_string(),
                ),
                (
                    "dropped_timeout",
                    stats.dropped_timeout.load(Ordering::Relaxed).to_string(),
                ),
                (
                    "protocol_errors",
                    stats.protocol_errors.load(Ordering::Relaxed).to_string(),
                ),
            ],
        ),
        (
            "proxy",
            vec![
                ("read_only", (settings.read_only() as u8).to_string()),
                (
                    "max_queued_requests",
                    settings.max_queued_requests().to_string(),
                ),
                (
                    "proxy_timeout_ms",
                    settings
                        .proxy_timeout()
                        .map_or(0, |timeout| timeout.as_millis())
                        .to_string(),
                ),
            ],
        ),
    ];

    let everything = matches!(section, None | Some("all" | "default" | "everything"));

    let mut out = String::new();
    for (name, fields) in sections {
        if !everything && section != Some(name) {
            continue;
        }

        if !out.is_empty() {
            out.push_str("\r\n");
        }
        let _ = write!(out, "# {}{}\r\n", name[..1].to_ascii_uppercase(), &name[1..]);
        for (field, value) in fields {
            let _ = write!(out, "{}:{}\r\n", field, value);
        }
    }
    out
}

// https://redis.io/commands/command
fn command(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let subcommand = args
        .optional(0)
        .map(|subcommand| String::from_utf8_lossy(subcommand).to_ascii_uppercase());
    let registry = proxy.dispatcher().registry();

    match subcommand.as_deref() {
        None | Some("DOCS") | Some("INFO") => Ok(Reply::array(vec![])),
        Some("COUNT") => Ok(Reply::integer(registry.len() as i64)),
        Some("LIST") => Ok(Reply::command(
            registry
                .names()
                .into_iter()
                .map(|name| Bytes::from(name.to_ascii_lowercase())),
        )),
        Some(subcommand) => Err(unknown_subcommand("COMMAND", subcommand)),
    }
}

fn subcommand_arity(command: &str, subcommand: &str) -> Error {
    format!(
        "ERR wrong number of arguments for '{}|{}' command",
        command, subcommand
    )
    .into()
}

fn unknown_subcommand(command: &str, subcommand: &str) -> Error {
    format!(
        "ERR unknown subcommand '{}'. Try {} HELP.",
        subcommand.to_ascii_lowercase(),
        command
    )
    .into()
}
