//! In-process store backend
//!
//! One mutex guards the whole dataset, and every session call runs start
//! to finish under it, so each call is one indivisible evaluation. Every
//! key carries a version that is bumped on write; `watch` records it and
//! `exec` refuses to run when it moved.
//!
//! Ordering follows Redis: `rank_range` lists equal scores by member in
//! descending byte order, like `ZREVRANGE`.

use crate::common::{Error, PoolConfig, Result};
use crate::store::pool::{Connector, Pool, Pooled};
use crate::store::{AtomicUnit, Command, FieldSet, Reply, Session, Store};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    order: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(old, member.to_string()));
        }
        self.order.insert((score, member.to_string()));
    }

    fn score(&self, member: &str) -> i64 {
        self.scores.get(member).copied().unwrap_or(0)
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn rev_range(&self, start: isize, stop: isize) -> Vec<(String, i64)> {
        let Some((start, stop)) = resolve_range(self.order.len(), start, stop) else {
            return Vec::new();
        };
        self.order
            .iter()
            .rev()
            .skip(start)
            .take(stop - start + 1)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }
}

/// Redis range semantics: negative indexes count from the end, both ends
/// inclusive, out-of-range ends clamp. `None` when the range is empty.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// The keyspace shared by every connection of one [`MemoryStore`]
#[derive(Debug, Default)]
pub struct Dataset {
    hashes: HashMap<String, BTreeMap<String, String>>,
    sorted: HashMap<String, SortedSet>,
    versions: HashMap<String, u64>,
}

impl Dataset {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn field_set(&self, key: &str) -> FieldSet {
        self.hashes
            .get(key)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn rev_range(&self, index: &str, start: isize, stop: isize) -> Vec<(String, i64)> {
        self.sorted
            .get(index)
            .map(|set| set.rev_range(start, stop))
            .unwrap_or_default()
    }

    fn apply(&mut self, command: &Command) -> Reply {
        match command {
            Command::ReadFields { key } => flatten(self.field_set(key)),
            Command::WriteFields { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field.clone(), value.clone()).is_none() {
                        added += 1;
                    }
                }
                if hash.is_empty() {
                    self.hashes.remove(key);
                }
                self.touch(key);
                Reply::Int(added)
            }
            Command::SetRank {
                index,
                member,
                score,
            } => {
                let set = self.sorted.entry(index.clone()).or_default();
                let added = !set.scores.contains_key(member);
                set.add(member, *score);
                self.touch(index);
                Reply::Int(added as i64)
            }
            Command::DeleteKey { key } => {
                let removed = self.hashes.remove(key).is_some() || self.sorted.remove(key).is_some();
                if removed {
                    self.touch(key);
                }
                Reply::Int(removed as i64)
            }
            Command::RemoveRank { index, member } => {
                let removed = match self.sorted.get_mut(index) {
                    Some(set) => {
                        let removed = set.remove(member);
                        if set.scores.is_empty() {
                            self.sorted.remove(index);
                        }
                        removed
                    }
                    None => false,
                };
                if removed {
                    self.touch(index);
                }
                Reply::Int(removed as i64)
            }
        }
    }

    fn evaluate(&mut self, unit: &AtomicUnit) -> Result<Reply> {
        match unit {
            AtomicUnit::IncrementLikes {
                record_key,
                likes_field,
                index_key,
                member,
            } => {
                let Some(record) = self.hashes.get_mut(record_key).filter(|h| !h.is_empty()) else {
                    return Ok(Reply::Array(vec![Reply::Int(0)]));
                };
                // Same failure as HINCRBY on a non-integer field: nothing is written.
                let current = match record.get(likes_field) {
                    Some(value) => value.parse::<i64>().map_err(|_| {
                        Error::Protocol(format!(
                            "{record_key} field {likes_field} is not an integer: {value:?}"
                        ))
                    })?,
                    None => 0,
                };
                let likes = current.checked_add(1).ok_or_else(|| {
                    Error::Protocol(format!("{record_key} field {likes_field} would overflow"))
                })?;
                let rank = self
                    .sorted
                    .get(index_key)
                    .map_or(0, |set| set.score(member))
                    .checked_add(1)
                    .ok_or_else(|| {
                        Error::Protocol(format!("{index_key} score of {member} would overflow"))
                    })?;

                record.insert(likes_field.clone(), likes.to_string());
                self.touch(record_key);
                self.sorted.entry(index_key.clone()).or_default().add(member, rank);
                self.touch(index_key);

                Ok(Reply::Array(vec![
                    Reply::Int(1),
                    Reply::Int(likes),
                    Reply::Text(rank.to_string()),
                ]))
            }
            AtomicUnit::RankedSnapshot {
                index_key,
                record_prefix,
                stop,
            } => {
                let entries = self
                    .rev_range(index_key, 0, *stop)
                    .into_iter()
                    .map(|(member, score)| {
                        let fields = self.field_set(&format!("{record_prefix}{member}"));
                        Reply::Array(vec![
                            Reply::Text(member),
                            Reply::Text(score.to_string()),
                            flatten(fields),
                        ])
                    })
                    .collect();
                Ok(Reply::Array(entries))
            }
        }
    }
}

fn flatten(fields: FieldSet) -> Reply {
    Reply::Array(
        fields
            .into_iter()
            .flat_map(|(f, v)| [Reply::Text(f), Reply::Text(v)])
            .collect(),
    )
}

type Shared = Arc<Mutex<Dataset>>;

fn lock(data: &Shared) -> MutexGuard<'_, Dataset> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MemoryConnector {
    data: Shared,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = Shared;

    async fn connect(&self) -> Result<Shared> {
        Ok(self.data.clone())
    }
}

/// In-process store with the same pooling behavior as the Redis backend
pub struct MemoryStore {
    pool: Pool<MemoryConnector>,
}

impl MemoryStore {
    pub fn new(pool: &PoolConfig) -> Self {
        let connector = MemoryConnector {
            data: Arc::new(Mutex::new(Dataset::default())),
        };
        Self {
            pool: Pool::new(connector, pool),
        }
    }

    pub fn pool(&self) -> &Pool<MemoryConnector> {
        &self.pool
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Session = MemorySession;

    async fn session(&self) -> Result<MemorySession> {
        Ok(MemorySession {
            conn: self.pool.get().await?,
            watched: Vec::new(),
        })
    }
}

pub struct MemorySession {
    conn: Pooled<MemoryConnector>,
    watched: Vec<(String, u64)>,
}

#[async_trait]
impl Session for MemorySession {
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn field_set(&mut self, key: &str) -> Result<FieldSet> {
        Ok(lock(&self.conn).field_set(key))
    }

    async fn rank_range(
        &mut self,
        index: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>> {
        Ok(lock(&self.conn).rev_range(index, start, stop))
    }

    async fn record_keys(&mut self, prefix: &str) -> Result<Vec<String>> {
        let data = lock(&self.conn);
        let mut keys: Vec<String> = data
            .hashes
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn evaluate(&mut self, unit: &AtomicUnit) -> Result<Reply> {
        lock(&self.conn).evaluate(unit)
    }

    async fn watch(&mut self, key: &str) -> Result<()> {
        let version = lock(&self.conn).version(key);
        self.watched.push((key.to_string(), version));
        Ok(())
    }

    async fn unwatch(&mut self) -> Result<()> {
        self.watched.clear();
        Ok(())
    }

    async fn exec(&mut self, batch: &[Command]) -> Result<Option<Vec<Reply>>> {
        let watched = std::mem::take(&mut self.watched);
        let mut data = lock(&self.conn);
        if watched
            .iter()
            .any(|(key, version)| data.version(key) != *version)
        {
            return Ok(None);
        }
        Ok(Some(batch.iter().map(|command| data.apply(command)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(data: &mut Dataset, member: &str, likes: i64) {
        data.apply(&Command::WriteFields {
            key: format!("album:{member}"),
            fields: vec![("likes".into(), likes.to_string())],
        });
        data.apply(&Command::SetRank {
            index: "likes".into(),
            member: member.into(),
            score: likes,
        });
    }

    fn increment(member: &str) -> AtomicUnit {
        AtomicUnit::IncrementLikes {
            record_key: format!("album:{member}"),
            likes_field: "likes".into(),
            index_key: "likes".into(),
            member: member.into(),
        }
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(4, 0, 2), Some((0, 2)));
        assert_eq!(resolve_range(4, 0, -1), Some((0, 3)));
        assert_eq!(resolve_range(4, 0, 10), Some((0, 3)));
        assert_eq!(resolve_range(4, -2, -1), Some((2, 3)));
        assert_eq!(resolve_range(4, 5, 8), None);
        assert_eq!(resolve_range(0, 0, 2), None);
        assert_eq!(resolve_range(4, 2, 1), None);
    }

    #[test]
    fn test_rev_range_tie_break_matches_redis() {
        let mut data = Dataset::default();
        seed(&mut data, "1", 8);
        seed(&mut data, "2", 3);
        seed(&mut data, "3", 12);
        seed(&mut data, "4", 8);

        let ranked = data.rev_range("likes", 0, -1);
        let members: Vec<&str> = ranked.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["3", "4", "1", "2"]);
    }

    #[test]
    fn test_increment_missing_record_writes_nothing() {
        let mut data = Dataset::default();
        let reply = data.evaluate(&increment("999")).unwrap();
        assert_eq!(reply, Reply::Array(vec![Reply::Int(0)]));
        assert!(data.hashes.is_empty());
        assert!(data.sorted.is_empty());
        assert!(data.versions.is_empty());
    }

    #[test]
    fn test_increment_updates_both_structures() {
        let mut data = Dataset::default();
        seed(&mut data, "2", 3);

        let reply = data.evaluate(&increment("2")).unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::Int(1), Reply::Int(4), Reply::Text("4".into())])
        );
        assert_eq!(data.rev_range("likes", 0, 0), vec![("2".to_string(), 4)]);
    }

    #[test]
    fn test_increment_non_integer_field_is_rejected() {
        let mut data = Dataset::default();
        data.apply(&Command::WriteFields {
            key: "album:7".into(),
            fields: vec![("likes".into(), "many".into())],
        });
        let before = data.version("likes");
        assert!(matches!(data.evaluate(&increment("7")), Err(Error::Protocol(_))));
        assert_eq!(data.version("likes"), before);
        assert!(data.sorted.get("likes").is_none());
    }

    #[test]
    fn test_increment_overflow_writes_nothing() {
        let mut data = Dataset::default();
        seed(&mut data, "5", i64::MAX);
        let before = (data.version("album:5"), data.version("likes"));

        assert!(matches!(data.evaluate(&increment("5")), Err(Error::Protocol(_))));
        assert_eq!((data.version("album:5"), data.version("likes")), before);
        assert_eq!(data.field_set("album:5"), vec![("likes".to_string(), i64::MAX.to_string())]);
    }

    #[test]
    fn test_snapshot_with_unbounded_stop_returns_everything() {
        let mut data = Dataset::default();
        seed(&mut data, "1", 8);
        seed(&mut data, "2", 3);
        seed(&mut data, "3", 12);

        let unit = AtomicUnit::RankedSnapshot {
            index_key: "likes".into(),
            record_prefix: "album:".into(),
            stop: isize::MAX,
        };
        let entries = data.evaluate(&unit).unwrap().into_array().unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_exec_aborts_when_watched_key_changes() {
        let store = MemoryStore::default();
        let mut watcher = store.session().await.unwrap();
        let mut writer = store.session().await.unwrap();

        watcher.watch("likes").await.unwrap();
        writer
            .exec(&[Command::SetRank {
                index: "likes".into(),
                member: "1".into(),
                score: 1,
            }])
            .await
            .unwrap();

        let read = [Command::ReadFields {
            key: "album:1".into(),
        }];
        assert_eq!(watcher.exec(&read).await.unwrap(), None);
        // the watch is gone after an aborted exec
        assert!(watcher.exec(&read).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_and_remove_rank_report_counts() {
        let store = MemoryStore::default();
        let mut session = store.session().await.unwrap();
        session
            .exec(&[
                Command::WriteFields {
                    key: "album:1".into(),
                    fields: vec![("title".into(), "Rumours".into())],
                },
                Command::SetRank {
                    index: "likes".into(),
                    member: "1".into(),
                    score: 0,
                },
            ])
            .await
            .unwrap();

        let removal = [
            Command::DeleteKey {
                key: "album:1".into(),
            },
            Command::RemoveRank {
                index: "likes".into(),
                member: "1".into(),
            },
        ];
        let replies = session.exec(&removal).await.unwrap().unwrap();
        assert_eq!(replies, vec![Reply::Int(1), Reply::Int(1)]);
        let replies = session.exec(&removal).await.unwrap().unwrap();
        assert_eq!(replies, vec![Reply::Int(0), Reply::Int(0)]);
        assert!(session.field_set("album:1").await.unwrap().is_empty());
    }
}
