//! Consistency coordinator
//!
//! Every read or write that touches both the album records and the ranking
//! index goes through [`Coordinator`]. It holds no catalog state of its own:
//! each call acquires one store session, does its work, and releases the
//! session on every exit path by dropping it.
//!
//! The invariant kept between the two structures is
//! `ranking[id] == record[id].likes` for every album.

use crate::common::{Error, Keyspace, Result, TopKConfig, TopKStrategy};
use crate::coordinator::album::{Album, AlbumId, LIKES_FIELD};
use crate::store::{AtomicUnit, Command, FieldSet, Reply, Session, Store};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct Coordinator<S: Store> {
    store: Arc<S>,
    keys: Keyspace,
    topk: TopKConfig,
}

impl<S: Store> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keys: self.keys.clone(),
            topk: self.topk.clone(),
        }
    }
}

impl<S: Store> Coordinator<S> {
    pub fn new(store: Arc<S>, keys: Keyspace, topk: TopKConfig) -> Self {
        Self { store, keys, topk }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keys
    }

    pub fn topk(&self) -> &TopKConfig {
        &self.topk
    }

    /// Check that a session can be acquired and the store answers
    pub async fn ping(&self) -> Result<()> {
        self.store.session().await?.ping().await
    }

    /// Fetch one album by id
    pub async fn get(&self, id: AlbumId) -> Result<Album> {
        let key = self.keys.record_key(&id.to_string());
        let fields = self.store.session().await?.field_set(&key).await?;
        if fields.is_empty() {
            return Err(Error::NotFound(id.to_string()));
        }
        Album::from_fields(fields)
    }

    /// Add one like to an existing album and return its new count.
    ///
    /// The existence check and both increments run as one atomic unit on
    /// the store. An absent album is left absent.
    pub async fn like(&self, id: AlbumId) -> Result<u64> {
        let member = id.to_string();
        let unit = AtomicUnit::IncrementLikes {
            record_key: self.keys.record_key(&member),
            likes_field: LIKES_FIELD.to_string(),
            index_key: self.keys.ranking_key.clone(),
            member,
        };
        let reply = self.store.session().await?.evaluate(&unit).await?;
        interpret_increment(id, reply)
    }

    /// The `k` most liked albums, highest first, as of one instant
    pub async fn top(&self, k: usize) -> Result<Vec<Album>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        // Inclusive last rank; any k past isize::MAX already covers every album.
        let stop = isize::try_from(k - 1).unwrap_or(isize::MAX);
        match self.topk.strategy {
            TopKStrategy::Script => self.top_scripted(stop).await,
            TopKStrategy::Optimistic => self.top_optimistic(stop).await,
        }
    }

    async fn top_scripted(&self, stop: isize) -> Result<Vec<Album>> {
        let unit = AtomicUnit::RankedSnapshot {
            index_key: self.keys.ranking_key.clone(),
            record_prefix: self.keys.record_prefix.clone(),
            stop,
        };
        let reply = self.store.session().await?.evaluate(&unit).await?;
        let entries = reply
            .into_array()
            .ok_or_else(|| Error::Protocol("ranked snapshot did not return an array".into()))?;

        entries
            .into_iter()
            .map(|entry| {
                let (member, score, fields) = split_snapshot_entry(entry)?;
                ranked_album(&member, score, fields)
            })
            .collect()
    }

    async fn top_optimistic(&self, stop: isize) -> Result<Vec<Album>> {
        let mut session = self.store.session().await?;

        for attempt in 1..=self.topk.max_attempts {
            session.watch(&self.keys.ranking_key).await?;
            let ranked = session.rank_range(&self.keys.ranking_key, 0, stop).await?;
            if ranked.is_empty() {
                session.unwatch().await?;
                return Ok(Vec::new());
            }

            let reads: Vec<Command> = ranked
                .iter()
                .map(|(member, _)| Command::ReadFields {
                    key: self.keys.record_key(member),
                })
                .collect();

            let Some(replies) = session.exec(&reads).await? else {
                warn!(attempt, "Ranking changed during read, restarting");
                continue;
            };

            return ranked
                .into_iter()
                .zip(replies)
                .map(|((member, score), reply)| {
                    let fields = reply.into_field_set().ok_or_else(|| {
                        Error::Protocol(format!("record {member} read returned a malformed reply"))
                    })?;
                    ranked_album(&member, score, fields)
                })
                .collect();
        }

        Err(Error::Conflict {
            attempts: self.topk.max_attempts,
        })
    }

    /// Write an album and its ranking entry in one transaction, replacing
    /// any previous record with the same id.
    pub async fn insert(&self, album: &Album) -> Result<()> {
        let member = album.id.to_string();
        let key = self.keys.record_key(&member);
        let score = i64::try_from(album.likes)
            .map_err(|_| Error::InvalidConfig(format!("album {member} has too many likes")))?;
        let batch = [
            Command::DeleteKey { key: key.clone() },
            Command::WriteFields {
                key,
                fields: album.to_fields(),
            },
            Command::SetRank {
                index: self.keys.ranking_key.clone(),
                member,
                score,
            },
        ];
        let mut session = self.store.session().await?;
        session
            .exec(&batch)
            .await?
            .ok_or_else(|| Error::Internal("unwatched transaction was aborted".into()))?;
        debug!(id = %album.id, "Inserted album");
        Ok(())
    }

    /// Delete an album and its ranking entry in one transaction.
    ///
    /// `NotFound` only when neither existed. A ranking entry left without
    /// its record is still cleaned up.
    pub async fn remove(&self, id: AlbumId) -> Result<()> {
        let member = id.to_string();
        let batch = [
            Command::DeleteKey {
                key: self.keys.record_key(&member),
            },
            Command::RemoveRank {
                index: self.keys.ranking_key.clone(),
                member,
            },
        ];
        let mut session = self.store.session().await?;
        let replies = session
            .exec(&batch)
            .await?
            .ok_or_else(|| Error::Internal("unwatched transaction was aborted".into()))?;
        let counts: Option<Vec<i64>> = replies.iter().map(Reply::as_int).collect();
        match counts.as_deref() {
            Some([0, 0]) => Err(Error::NotFound(id.to_string())),
            Some([0, _]) => {
                warn!(%id, "Removed ranking entry of an album without a record");
                Ok(())
            }
            Some([_, _]) => Ok(()),
            _ => Err(Error::Protocol(format!(
                "removal of {id} returned {replies:?}"
            ))),
        }
    }
}

/// Read the reply of an `IncrementLikes` unit.
///
/// `[0]` is an absent album. `[1, likes, rank]` is an applied increment,
/// and the two counts must agree.
pub fn interpret_increment(id: AlbumId, reply: Reply) -> Result<u64> {
    let items = match reply {
        Reply::Array(items) => items,
        other => {
            return Err(Error::Protocol(format!(
                "increment of {id} returned {other:?}"
            )))
        }
    };
    match items.as_slice() {
        [flag] if flag.as_int() == Some(0) => Err(Error::NotFound(id.to_string())),
        [flag, likes, rank] if flag.as_int() == Some(1) => {
            let (Some(likes), Some(rank)) = (likes.as_int(), rank.as_int()) else {
                return Err(Error::Protocol(format!(
                    "increment of {id} returned non-integer counts {items:?}"
                )));
            };
            if likes != rank {
                error!(%id, likes, rank, "Record and ranking disagree after increment");
                return Err(Error::Protocol(format!(
                    "album {id} has {likes} likes but ranks with {rank}"
                )));
            }
            u64::try_from(likes)
                .map_err(|_| Error::Protocol(format!("album {id} has negative likes {likes}")))
        }
        _ => Err(Error::Protocol(format!(
            "increment of {id} returned {items:?}"
        ))),
    }
}

fn split_snapshot_entry(entry: Reply) -> Result<(String, i64, FieldSet)> {
    let malformed = |what: &str| Error::Protocol(format!("ranked snapshot entry {what}"));
    let parts = entry.into_array().ok_or_else(|| malformed("is not an array"))?;
    let mut parts = parts.into_iter();
    let (Some(member), Some(score), Some(fields), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed("does not have three parts"));
    };
    let member = member
        .as_text()
        .map(str::to_string)
        .ok_or_else(|| malformed("has a non-text member"))?;
    let score = score.as_int().ok_or_else(|| malformed("has a non-integer score"))?;
    let fields = fields
        .into_field_set()
        .ok_or_else(|| malformed("has a malformed field set"))?;
    Ok((member, score, fields))
}

/// Build the album for one ranking entry, refusing any entry whose record
/// is missing or disagrees with the score it was ranked by.
fn ranked_album(member: &str, score: i64, fields: FieldSet) -> Result<Album> {
    if fields.is_empty() {
        error!(member, score, "Ranked album has no record");
        return Err(Error::Protocol(format!("ranked album {member} has no record")));
    }
    let album = Album::from_fields(fields)?;
    if album.id.to_string() != member {
        return Err(Error::Protocol(format!(
            "ranked member {member} holds record for album {}",
            album.id
        )));
    }
    if i64::try_from(album.likes).ok() != Some(score) {
        error!(member, score, likes = album.likes, "Ranked album score drift");
        return Err(Error::Protocol(format!(
            "album {member} has {} likes but ranks with {score}",
            album.likes
        )));
    }
    Ok(album)
}
