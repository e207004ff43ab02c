//! Redis store backend
//!
//! Atomic units are Lua scripts run with `EVALSHA` (falling back to `EVAL`
//! and caching on `NOSCRIPT`). Conditional transactions are
//! `WATCH` + `MULTI`/`EXEC` on a connection owned by one session at a time.
//!
//! A session that is dropped while a watch is still registered, or after a
//! transport failure, closes its connection rather than handing a connection
//! in an unknown state back to the pool.

use crate::common::{Error, PoolConfig, Result, StoreConfig};
use crate::store::pool::{Connector, Pool, Pooled};
use crate::store::{AtomicUnit, Command, FieldSet, Reply, Session, Store};
use ::redis::aio::MultiplexedConnection;
use ::redis::{RedisResult, Script, Value};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// KEYS: record, ranking index. ARGV: member, likes field.
const INCREMENT_LIKES: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {0}
end
local likes = redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
local rank = redis.call('ZINCRBY', KEYS[2], 1, ARGV[1])
return {1, likes, rank}
"#;

/// KEYS: ranking index. ARGV: record prefix, last rank (inclusive).
const RANKED_SNAPSHOT: &str = r#"
local ranked = redis.call('ZREVRANGE', KEYS[1], 0, ARGV[2], 'WITHSCORES')
local out = {}
for i = 1, #ranked, 2 do
    local member = ranked[i]
    out[#out + 1] = {member, ranked[i + 1], redis.call('HGETALL', ARGV[1] .. member)}
end
return out
"#;

const SCAN_COUNT: usize = 256;

struct Scripts {
    increment_likes: Script,
    ranked_snapshot: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            increment_likes: Script::new(INCREMENT_LIKES),
            ranked_snapshot: Script::new(RANKED_SNAPSHOT),
        }
    }
}

pub struct RedisConnector {
    client: ::redis::Client,
    timeout: Duration,
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;

    async fn connect(&self) -> Result<MultiplexedConnection> {
        bounded(self.timeout, self.client.get_multiplexed_tokio_connection()).await
    }
}

pub struct RedisStore {
    pool: Pool<RedisConnector>,
    scripts: Arc<Scripts>,
    timeout: Duration,
}

impl RedisStore {
    /// Create the store. No connection is opened until the first session.
    pub fn open(store: &StoreConfig, pool: &PoolConfig) -> Result<Self> {
        let client = ::redis::Client::open(store.url.as_str())
            .map_err(|e| Error::InvalidConfig(format!("redis url {:?}: {}", store.url, e)))?;
        let timeout = store.response_timeout();
        Ok(Self {
            pool: Pool::new(RedisConnector { client, timeout }, pool),
            scripts: Arc::new(Scripts::new()),
            timeout,
        })
    }

    pub fn pool(&self) -> &Pool<RedisConnector> {
        &self.pool
    }
}

#[async_trait]
impl Store for RedisStore {
    type Session = RedisSession;

    async fn session(&self) -> Result<RedisSession> {
        Ok(RedisSession {
            conn: self.pool.get().await?,
            scripts: self.scripts.clone(),
            timeout: self.timeout,
            watching: false,
        })
    }
}

pub struct RedisSession {
    conn: Pooled<RedisConnector>,
    scripts: Arc<Scripts>,
    timeout: Duration,
    watching: bool,
}

/// Bound one round trip by `timeout`
async fn bounded<T>(timeout: Duration, fut: impl Future<Output = RedisResult<T>>) -> Result<T> {
    Ok(tokio::time::timeout(timeout, fut).await??)
}

impl RedisSession {
    /// Give up the connection after failures that may leave it mid-reply
    fn check<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_retryable() {
                self.conn.discard();
            }
        }
        res
    }

    async fn query(&mut self, cmd: &::redis::Cmd) -> Result<Reply> {
        let res: Result<Value> = bounded(self.timeout, cmd.query_async(&mut *self.conn)).await;
        self.check(res).map(Reply::from)
    }
}

impl Drop for RedisSession {
    fn drop(&mut self) {
        if self.watching {
            self.conn.discard();
        }
    }
}

#[async_trait]
impl Session for RedisSession {
    async fn ping(&mut self) -> Result<()> {
        match self.query(&::redis::cmd("PING")).await? {
            Reply::Text(_) | Reply::Okay => Ok(()),
            other => Err(Error::Protocol(format!("unexpected PING reply: {other:?}"))),
        }
    }

    async fn field_set(&mut self, key: &str) -> Result<FieldSet> {
        let reply = self.query(::redis::cmd("HGETALL").arg(key)).await?;
        reply
            .into_field_set()
            .ok_or_else(|| Error::Protocol(format!("HGETALL {key} returned a malformed reply")))
    }

    async fn rank_range(
        &mut self,
        index: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>> {
        let reply = self
            .query(
                ::redis::cmd("ZREVRANGE")
                    .arg(index)
                    .arg(start)
                    .arg(stop)
                    .arg("WITHSCORES"),
            )
            .await?;
        reply
            .into_scored_members()
            .ok_or_else(|| Error::Protocol(format!("ZREVRANGE {index} returned a malformed reply")))
    }

    async fn record_keys(&mut self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();
        loop {
            let reply = self
                .query(
                    ::redis::cmd("SCAN")
                        .arg(&cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT),
                )
                .await?;
            let malformed = || Error::Protocol("SCAN returned a malformed reply".into());
            let mut parts = reply.into_array().ok_or_else(malformed)?.into_iter();
            let (Some(Reply::Text(next)), Some(Reply::Array(batch))) = (parts.next(), parts.next())
            else {
                return Err(malformed());
            };
            for key in batch {
                match key {
                    Reply::Text(key) => keys.push(key),
                    _ => return Err(malformed()),
                }
            }
            if next == "0" {
                break;
            }
            cursor = next;
        }
        // SCAN may report a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn evaluate(&mut self, unit: &AtomicUnit) -> Result<Reply> {
        let invocation = match unit {
            AtomicUnit::IncrementLikes {
                record_key,
                likes_field,
                index_key,
                member,
            } => {
                let mut invocation = self.scripts.increment_likes.prepare_invoke();
                invocation
                    .key(record_key)
                    .key(index_key)
                    .arg(member)
                    .arg(likes_field);
                invocation
            }
            AtomicUnit::RankedSnapshot {
                index_key,
                record_prefix,
                stop,
            } => {
                let mut invocation = self.scripts.ranked_snapshot.prepare_invoke();
                invocation.key(index_key).arg(record_prefix).arg(*stop);
                invocation
            }
        };
        tracing::debug!("Evaluating {:?}", unit);
        let res: Result<Value> =
            bounded(self.timeout, invocation.invoke_async(&mut *self.conn)).await;
        self.check(res).map(Reply::from)
    }

    async fn watch(&mut self, key: &str) -> Result<()> {
        // Set first: if the reply is lost the server may still hold the watch.
        self.watching = true;
        self.query(::redis::cmd("WATCH").arg(key)).await?;
        Ok(())
    }

    async fn unwatch(&mut self) -> Result<()> {
        self.query(&::redis::cmd("UNWATCH")).await?;
        self.watching = false;
        Ok(())
    }

    async fn exec(&mut self, batch: &[Command]) -> Result<Option<Vec<Reply>>> {
        if batch.is_empty() {
            // redis-rs does not send an empty pipeline, so EXEC would never clear the watch.
            self.unwatch().await?;
            return Ok(Some(Vec::new()));
        }
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in batch {
            match command {
                Command::ReadFields { key } => {
                    pipe.cmd("HGETALL").arg(key);
                }
                Command::WriteFields { key, fields } => {
                    pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        pipe.arg(field).arg(value);
                    }
                }
                Command::SetRank {
                    index,
                    member,
                    score,
                } => {
                    pipe.cmd("ZADD").arg(index).arg(*score).arg(member);
                }
                Command::DeleteKey { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                Command::RemoveRank { index, member } => {
                    pipe.cmd("ZREM").arg(index).arg(member);
                }
            }
        }

        let res: Result<Value> = bounded(self.timeout, pipe.query_async(&mut *self.conn)).await;
        let value = self.check(res)?;
        // EXEC clears the watch whether it ran the batch or not.
        self.watching = false;

        match Reply::from(value) {
            Reply::Nil => Ok(None),
            Reply::Array(replies) if replies.len() == batch.len() => Ok(Some(replies)),
            other => Err(Error::Protocol(format!(
                "EXEC of {} commands returned {:?}",
                batch.len(),
                other
            ))),
        }
    }
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        match value {
            Value::Nil => Reply::Nil,
            Value::Okay => Reply::Okay,
            Value::Int(n) => Reply::Int(n),
            Value::BulkString(bytes) => Reply::Text(String::from_utf8_lossy(&bytes).into_owned()),
            Value::SimpleString(s) => Reply::Text(s),
            Value::Double(d) => Reply::Text(d.to_string()),
            Value::Boolean(b) => Reply::Int(b as i64),
            Value::Array(items) | Value::Set(items) => {
                Reply::Array(items.into_iter().map(Reply::from).collect())
            }
            Value::Map(pairs) => Reply::Array(
                pairs
                    .into_iter()
                    .flat_map(|(k, v)| [Reply::from(k), Reply::from(v)])
                    .collect(),
            ),
            other => Reply::Error(format!("{other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("album:"), "album:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_value_conversion() {
        let value = Value::Array(vec![
            Value::Int(1),
            Value::Int(4),
            Value::BulkString(b"4".to_vec()),
        ]);
        let reply = Reply::from(value);
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::Int(1), Reply::Int(4), Reply::Text("4".into())])
        );

        let map = Value::Map(vec![(
            Value::BulkString(b"title".to_vec()),
            Value::BulkString(b"Rumours".to_vec()),
        )]);
        assert_eq!(
            Reply::from(map).into_field_set().unwrap(),
            vec![("title".to_string(), "Rumours".to_string())]
        );
    }

    #[test]
    fn test_open_rejects_bad_url() {
        let store = StoreConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            RedisStore::open(&store, &PoolConfig::default()),
            Err(Error::InvalidConfig(_))
        ));
    }
}
