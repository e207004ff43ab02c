//! Store collaborator
//!
//! The coordinator never talks to a backend directly. It acquires a
//! [`Session`] from a [`Store`], and a session exposes exactly what the
//! consistency protocol needs:
//! - field sets addressed by key (`HGETALL`)
//! - one descending score index (`ZREVRANGE ... WITHSCORES`)
//! - named atomic units evaluated on the store in one indivisible step
//! - watch + conditional transaction for optimistic reads and bulk writes
//!
//! Two backends implement it: [`RedisStore`] (Lua scripts, `WATCH`/`MULTI`/`EXEC`)
//! and [`MemoryStore`] (one keyspace mutex, per-key versions).
//!
//! ## Atomic unit replies
//!
//! ```text
//! IncrementLikes   absent  -> [0]
//!                  applied -> [1, record_likes, rank_likes]
//! RankedSnapshot           -> [[member, rank_score, [field, value, ...]], ...]
//! ```
//!
//! Both backends produce these shapes. Interpreting them is the coordinator's
//! job, so a shape mismatch surfaces there as a protocol error.

use crate::common::Result;
use async_trait::async_trait;

pub mod memory;
pub mod pool;
pub mod redis;

pub use memory::MemoryStore;
pub use pool::{Connector, Pool, PoolStatus, Pooled};
pub use self::redis::RedisStore;

/// Field/value pairs of one record
pub type FieldSet = Vec<(String, String)>;

/// A backend-neutral store reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Okay,
    Int(i64),
    Text(String),
    Array(Vec<Reply>),
    /// Error reply, or a reply type this crate does not interpret
    Error(String),
}

impl Reply {
    /// Integer value, accepting the textual scores sorted sets reply with
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            Reply::Text(s) => parse_score(s),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Flat `[field, value, field, value, ...]` into pairs
    pub fn into_field_set(self) -> Option<FieldSet> {
        let items = self.into_array()?;
        if items.len() % 2 != 0 {
            return None;
        }
        let mut fields = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            match (field, value) {
                (Reply::Text(f), Reply::Text(v)) => fields.push((f, v)),
                (Reply::Text(f), Reply::Int(n)) => fields.push((f, n.to_string())),
                _ => return None,
            }
        }
        Some(fields)
    }

    /// Members with scores, from either a flat `[m, s, m, s]` reply or
    /// nested `[[m, s], ...]` pairs.
    pub fn into_scored_members(self) -> Option<Vec<(String, i64)>> {
        let items = self.into_array()?;
        if items.iter().all(|item| matches!(item, Reply::Array(_))) {
            return items
                .into_iter()
                .map(|pair| {
                    let pair = pair.into_array()?;
                    match pair.as_slice() {
                        [member, score] => Some((member.as_text()?.to_string(), score.as_int()?)),
                        _ => None,
                    }
                })
                .collect();
        }
        if items.len() % 2 != 0 {
            return None;
        }
        items
            .chunks(2)
            .map(|pair| Some((pair[0].as_text()?.to_string(), pair[1].as_int()?)))
            .collect()
    }
}

/// Parse a sorted-set score. Scores are likes counts, so only integral
/// values are accepted (`"12"`, `"12.0"`).
pub fn parse_score(s: &str) -> Option<i64> {
    if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    }
    let f: f64 = s.parse().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// One entry of a conditional transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `HGETALL key`, replies the flat field set
    ReadFields { key: String },
    /// `HSET key f v ...`
    WriteFields { key: String, fields: FieldSet },
    /// `ZADD index score member`
    SetRank {
        index: String,
        member: String,
        score: i64,
    },
    /// `DEL key`, replies the number of keys removed
    DeleteKey { key: String },
    /// `ZREM index member`, replies the number of members removed
    RemoveRank { index: String, member: String },
}

/// A small program evaluated on the store as one indivisible step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicUnit {
    /// If `record_key` exists, add 1 to its `likes_field` and to `member`
    /// in `index_key`. Otherwise change nothing.
    IncrementLikes {
        record_key: String,
        likes_field: String,
        index_key: String,
        member: String,
    },
    /// Members of `index_key` at ranks `0..=stop` with the record stored
    /// under `{record_prefix}{member}` for each. `stop` is at least 0.
    RankedSnapshot {
        index_key: String,
        record_prefix: String,
        stop: isize,
    },
}

/// Scoped access to the store. Dropping the session releases its connection.
#[async_trait]
pub trait Session: Send {
    async fn ping(&mut self) -> Result<()>;

    /// All fields of `key`; empty when the key does not exist
    async fn field_set(&mut self, key: &str) -> Result<FieldSet>;

    /// Members of `index` by descending score, ranks `start..=stop`
    /// (negative ranks count from the end, as in Redis)
    async fn rank_range(
        &mut self,
        index: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>>;

    /// Every key starting with `prefix`
    async fn record_keys(&mut self, prefix: &str) -> Result<Vec<String>>;

    async fn evaluate(&mut self, unit: &AtomicUnit) -> Result<Reply>;

    /// Make the next [`Session::exec`] conditional on `key` staying unchanged
    async fn watch(&mut self, key: &str) -> Result<()>;

    async fn unwatch(&mut self) -> Result<()>;

    /// Run `batch` as one transaction. `None` means a watched key changed
    /// and nothing in the batch ran. Watches are cleared either way.
    async fn exec(&mut self, batch: &[Command]) -> Result<Option<Vec<Reply>>>;
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Session: Session + 'static;

    /// Acquire a session, waiting for a pooled connection if necessary
    async fn session(&self) -> Result<Self::Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Reply {
        Reply::Text(s.to_string())
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("12"), Some(12));
        assert_eq!(parse_score("12.0"), Some(12));
        assert_eq!(parse_score("-3"), Some(-3));
        assert_eq!(parse_score("1.5"), None);
        assert_eq!(parse_score("inf"), None);
        assert_eq!(parse_score("likes"), None);
    }

    #[test]
    fn test_into_field_set() {
        let reply = Reply::Array(vec![text("title"), text("Rumours"), text("likes"), Reply::Int(12)]);
        assert_eq!(
            reply.into_field_set().unwrap(),
            vec![
                ("title".to_string(), "Rumours".to_string()),
                ("likes".to_string(), "12".to_string())
            ]
        );

        assert!(Reply::Array(vec![text("title")]).into_field_set().is_none());
        assert!(Reply::Int(1).into_field_set().is_none());
        assert_eq!(Reply::Array(vec![]).into_field_set(), Some(vec![]));
    }

    #[test]
    fn test_into_scored_members_flat_and_nested() {
        let flat = Reply::Array(vec![text("3"), text("12"), text("1"), text("8")]);
        let nested = Reply::Array(vec![
            Reply::Array(vec![text("3"), text("12")]),
            Reply::Array(vec![text("1"), text("8")]),
        ]);
        let expected = vec![("3".to_string(), 12), ("1".to_string(), 8)];
        assert_eq!(flat.into_scored_members().unwrap(), expected);
        assert_eq!(nested.into_scored_members().unwrap(), expected);
        assert_eq!(Reply::Array(vec![]).into_scored_members(), Some(vec![]));
    }
}
