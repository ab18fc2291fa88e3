use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use itertools::Itertools;

use super::{expire_time, invalid_expire_time};
use crate::backend::{SetCondition, SetOptions};
use crate::codec::parse_integer;
use crate::dispatch::{ArgError, Args};
use crate::proxy::Proxy;
use crate::registry::{Descriptor, Kind};
use crate::reply::Reply;
use crate::Error;

pub fn descriptors() -> Vec<Descriptor> {
    vec![
        Descriptor::new("GET", Kind::Read, "key", get),
        Descriptor::new("SET", Kind::Write, "key value options...", set),
        Descriptor::new("SETNX", Kind::Write, "key value", setnx),
        Descriptor::new("GETSET", Kind::Write, "key value", getset),
        Descriptor::new("GETDEL", Kind::Write, "key", getdel),
        Descriptor::new("MGET", Kind::Read, "keys...", mget),
        Descriptor::new("MSET", Kind::Write, "pairs...", mset),
        Descriptor::new("INCR", Kind::Write, "key", incr),
        Descriptor::new("DECR", Kind::Write, "key", decr),
        Descriptor::new("INCRBY", Kind::Write, "key increment", incrby),
        Descriptor::new("DECRBY", Kind::Write, "key decrement", decrby),
        Descriptor::new("APPEND", Kind::Write, "key value", append),
        Descriptor::new("STRLEN", Kind::Read, "key", strlen),
    ]
}

// https://redis.io/commands/get
fn get(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let key = args.bytes(0)?;
    Ok(Reply::future(proxy.backend().get(key), Reply::Bulk))
}

// https://redis.io/commands/set
fn set(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let key = args.bytes(0)?;
    let value = args.bytes(1)?;
    let options = set_options(args.rest(2))?;

    Ok(Reply::future(
        proxy.backend().set(key, value, options),
        |written| if written { Reply::ok() } else { Reply::null() },
    ))
}

fn set_options(tokens: &[Bytes]) -> Result<SetOptions, Error> {
    let mut options = SetOptions::default();
    let mut tokens = tokens.iter();

    while let Some(token) = tokens.next() {
        match token.to_ascii_uppercase().as_slice() {
            b"NX" if options.condition == SetCondition::Always => {
                options.condition = SetCondition::IfMissing;
            }
            b"XX" if options.condition == SetCondition::Always => {
                options.condition = SetCondition::IfExists;
            }
            unit @ (b"EX" | b"PX") if options.expire.is_none() => {
                let amount = tokens.next().ok_or(ArgError::Syntax)?;
                let amount = parse_integer(amount).ok_or(ArgError::NotInteger)?;
                if amount <= 0 {
                    return Err(invalid_expire_time("set"));
                }

                let ttl = if unit == b"EX" {
                    Duration::from_secs(amount as u64)
                } else {
                    Duration::from_millis(amount as u64)
                };
                options.expire = Some(expire_time("set", ttl)?);
            }
            _ => return Err(ArgError::Syntax.into()),
        }
    }

    Ok(options)
}

// https://redis.io/commands/setnx
fn setnx(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let options = SetOptions {
        condition: SetCondition::IfMissing,
        ..Default::default()
    };
    let fut = proxy.backend().set(args.bytes(0)?, args.bytes(1)?, options);

    Ok(Reply::future(fut, |written| Reply::integer(written as i64)))
}

// https://redis.io/commands/getset
fn getset(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().getset(args.bytes(0)?, args.bytes(1)?);
    Ok(Reply::future(fut, Reply::Bulk))
}

// https://redis.io/commands/getdel
fn getdel(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().getdel(args.bytes(0)?);
    Ok(Reply::future(fut, Reply::Bulk))
}

// https://redis.io/commands/mget
fn mget(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().mget(args.non_empty_rest(0)?);

    Ok(Reply::future(fut, |values| {
        Reply::array(values.into_iter().map(Reply::Bulk).collect())
    }))
}

// https://redis.io/commands/mset
fn mset(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let tokens = args.non_empty_rest(0)?;
    if tokens.len() % 2 != 0 {
        return Err(args.wrong_arity().into());
    }

    let pairs = tokens.into_iter().tuples().collect();
    Ok(Reply::future(proxy.backend().mset(pairs), |_| Reply::ok()))
}

// https://redis.io/commands/incr
fn incr(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    incr_by(proxy, args.bytes(0)?, 1)
}

// https://redis.io/commands/decr
fn decr(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    incr_by(proxy, args.bytes(0)?, -1)
}

// https://redis.io/commands/incrby
fn incrby(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    incr_by(proxy, args.bytes(0)?, args.integer(1)?)
}

// https://redis.io/commands/decrby
fn decrby(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let decrement = args
        .integer(1)?
        .checked_neg()
        .ok_or("ERR decrement would overflow")?;
    incr_by(proxy, args.bytes(0)?, decrement)
}

fn incr_by(proxy: &Arc<Proxy>, key: Bytes, increment: i64) -> Result<Reply, Error> {
    Ok(Reply::future(
        proxy.backend().incr_by(key, increment),
        Reply::Integer,
    ))
}

// https://redis.io/commands/append
fn append(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().append(args.bytes(0)?, args.bytes(1)?);
    Ok(Reply::future(fut, Reply::Integer))
}

// https://redis.io/commands/strlen
fn strlen(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().strlen(args.bytes(0)?);
    Ok(Reply::future(fut, Reply::Integer))
}
