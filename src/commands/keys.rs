use std::sync::Arc;
use std::time::Duration;

use super::expire_time;
use crate::backend::Ttl;
use crate::dispatch::Args;
use crate::proxy::Proxy;
use crate::registry::{Descriptor, Kind};
use crate::reply::Reply;
use crate::Error;

pub fn descriptors() -> Vec<Descriptor> {
    vec![
        Descriptor::new("DEL", Kind::Write, "keys...", del),
        Descriptor::new("EXISTS", Kind::Read, "keys...", exists),
        Descriptor::new("EXPIRE", Kind::Write, "key seconds", expire),
        Descriptor::new("PEXPIRE", Kind::Write, "key milliseconds", pexpire),
        Descriptor::new("PERSIST", Kind::Write, "key", persist),
        Descriptor::new("TTL", Kind::Read, "key", ttl),
        Descriptor::new("PTTL", Kind::Read, "key", pttl),
        Descriptor::new("TYPE", Kind::Read, "key", type_),
        Descriptor::new("KEYS", Kind::Read, "pattern", keys),
        Descriptor::new("DBSIZE", Kind::Read, "", dbsize),
        Descriptor::new("FLUSHDB", Kind::Write, "", flushdb),
    ]
}

// https://redis.io/commands/del
fn del(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().del(args.non_empty_rest(0)?);
    Ok(Reply::future(fut, Reply::Integer))
}

// https://redis.io/commands/exists
fn exists(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().exists(args.non_empty_rest(0)?);
    Ok(Reply::future(fut, Reply::Integer))
}

// https://redis.io/commands/expire
fn expire(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let seconds = args.integer(1)?;
    let timeout = Duration::from_secs(seconds.max(0) as u64);
    expire_in(proxy, args, timeout)
}

// https://redis.io/commands/pexpire
fn pexpire(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let millis = args.integer(1)?;
    let timeout = Duration::from_millis(millis.max(0) as u64);
    expire_in(proxy, args, timeout)
}

// A timeout that is not positive deletes the key.
fn expire_in(proxy: &Arc<Proxy>, args: Args, timeout: Duration) -> Result<Reply, Error> {
    let timeout = expire_time(args.command(), timeout)?;
    let fut = proxy.backend().expire(args.bytes(0)?, timeout);
    Ok(Reply::future(fut, |applied| Reply::integer(applied as i64)))
}

// https://redis.io/commands/persist
fn persist(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().persist(args.bytes(0)?);
    Ok(Reply::future(fut, |applied| Reply::integer(applied as i64)))
}

// https://redis.io/commands/ttl
fn ttl(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().ttl(args.bytes(0)?);
    // Rounded to the closest second.
    Ok(Reply::future(fut, |ttl| {
        ttl_reply(ttl, |remaining| (remaining.as_millis() + 500) / 1000)
    }))
}

// https://redis.io/commands/pttl
fn pttl(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().ttl(args.bytes(0)?);
    Ok(Reply::future(fut, |ttl| {
        ttl_reply(ttl, |remaining| remaining.as_millis())
    }))
}

fn ttl_reply(ttl: Ttl, unit: impl FnOnce(Duration) -> u128) -> Reply {
    match ttl {
        Ttl::Missing => Reply::integer(-2),
        Ttl::Persistent => Reply::integer(-1),
        Ttl::Expires(remaining) => {
            Reply::integer(i64::try_from(unit(remaining)).unwrap_or(i64::MAX))
        }
    }
}

// https://redis.io/commands/type
fn type_(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().key_type(args.bytes(0)?);
    Ok(Reply::future(fut, Reply::Status))
}

// https://redis.io/commands/keys
fn keys(proxy: &Arc<Proxy>, args: Args) -> Result<Reply, Error> {
    let fut = proxy.backend().keys(args.bytes(0)?);
    Ok(Reply::future(fut, Reply::command))
}

// https://redis.io/commands/dbsize
fn dbsize(proxy: &Arc<Proxy>, _args: Args) -> Result<Reply, Error> {
    Ok(Reply::future(proxy.backend().dbsize(), Reply::Integer))
}

// https://redis.io/commands/flushdb
fn flushdb(proxy: &Arc<Proxy>, _args: Args) -> Result<Reply, Error> {
    Ok(Reply::future(proxy.backend().flushdb(), |_| Reply::ok()))
}

#[cfg(test)]
mod tests {
    use crate::reply::Reply;
    use crate::testing;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn del_and_exists() {
        let proxy = testing::proxy();
        testing::execute(&proxy, &["MSET", "a", "1", "b", "2"]).await;

        assert_eq!(
            testing::execute(&proxy, &["EXISTS", "a", "b", "c", "a"]).await,
            Reply::integer(3)
        );
        assert_eq!(
            testing::execute(&proxy, &["DEL", "a", "c"]).await,
            Reply::integer(1)
        );
        assert_eq!(
            testing::execute(&proxy, &["EXISTS", "a"]).await,
            Reply::integer(0)
        );
        assert!(testing::execute(&proxy, &["DEL"]).await.is_error());
    }

    #[tokio::test]
    async fn expire_ttl_and_persist() {
        time::pause();
        let proxy = testing::proxy();
        testing::execute(&proxy, &["SET", "k", "v"]).await;

        assert_eq!(testing::execute(&proxy, &["TTL", "k"]).await, Reply::integer(-1));
        assert_eq!(
            testing::execute(&proxy, &["TTL", "missing"]).await,
            Reply::integer(-2)
        );
        assert_eq!(
            testing::execute(&proxy, &["EXPIRE", "k", "10"]).await,
            Reply::integer(1)
        );
        assert_eq!(testing::execute(&proxy, &["TTL", "k"]).await, Reply::integer(10));
        assert_eq!(
            testing::execute(&proxy, &["PTTL", "k"]).await,
            Reply::integer(10_000)
        );

        assert_eq!(
            testing::execute(&proxy, &["PERSIST", "k"]).await,
            Reply::integer(1)
        );
        assert_eq!(
            testing::execute(&proxy, &["PERSIST", "k"]).await,
            Reply::integer(0)
        );

        assert_eq!(
            testing::execute(&proxy, &["PEXPIRE", "k", "50"]).await,
            Reply::integer(1)
        );
        time::advance(Duration::from_millis(60)).await;
        assert_eq!(
            testing::execute(&proxy, &["EXISTS", "k"]).await,
            Reply::integer(0)
        );
        assert_eq!(
            testing::execute(&proxy, &["EXPIRE", "k", "10"]).await,
            Reply::integer(0)
        );
    }

    #[tokio::test]
    async fn non_positive_expire_deletes() {
        let proxy = testing::proxy();
        testing::execute(&proxy, &["SET", "k", "v"]).await;

        assert_eq!(
            testing::execute(&proxy, &["EXPIRE", "k", "-1"]).await,
            Reply::integer(1)
        );
        assert_eq!(testing::execute(&proxy, &["GET", "k"]).await, Reply::null());
    }

    #[tokio::test]
    async fn unrepresentable_expire_is_rejected() {
        let proxy = testing::proxy();
        testing::execute(&proxy, &["SET", "k", "v"]).await;

        assert_eq!(
            testing::execute(&proxy, &["EXPIRE", "k", "9223372036854775807"]).await,
            Reply::Error("ERR invalid expire time in 'expire' command".to_string())
        );
        assert_eq!(
            testing::execute(&proxy, &["PEXPIRE", "k", "9223372036854775807"]).await,
            Reply::Error("ERR invalid expire time in 'pexpire' command".to_string())
        );
        assert_eq!(testing::execute(&proxy, &["TTL", "k"]).await, Reply::integer(-1));
        assert_eq!(testing::execute(&proxy, &["GET", "k"]).await, Reply::bulk("v"));
    }

    #[tokio::test]
    async fn type_keys_dbsize_flushdb() {
        let proxy = testing::proxy();
        testing::execute(&proxy, &["MSET", "user:1", "a", "user:2", "b", "other", "c"]).await;

        assert_eq!(
            testing::execute(&proxy, &["TYPE", "user:1"]).await,
            Reply::status("string")
        );
        assert_eq!(
            testing::execute(&proxy, &["TYPE", "nope"]).await,
            Reply::status("none")
        );
        assert_eq!(
            testing::execute(&proxy, &["KEYS", "user:*"]).await,
            Reply::array(vec![Reply::bulk("user:1"), Reply::bulk("user:2")])
        );
        assert_eq!(testing::execute(&proxy, &["DBSIZE"]).await, Reply::integer(3));
        assert_eq!(testing::execute(&proxy, &["FLUSHDB"]).await, Reply::ok());
        assert_eq!(testing::execute(&proxy, &["DBSIZE"]).await, Reply::integer(0));
        assert_eq!(
            testing::execute(&proxy, &["KEYS", "*"]).await,
            Reply::array(vec![])
        );
    }
}
