//! Optimistic top-K reads under interference
//!
//! `Interfering` wraps the memory store and, while a session reads the
//! ranking, likes an album through a second session. The optimistic read
//! must notice the change and start over.

use albumkv::common::{Error, Keyspace, Result, TopKConfig, TopKStrategy};
use albumkv::ops::{demo_catalog, seed_catalog, verify_catalog};
use albumkv::store::memory::MemorySession;
use albumkv::store::{AtomicUnit, Command, FieldSet, Reply, Session, Store};
use albumkv::{AlbumId, Coordinator, MemoryStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Interfering {
    inner: Arc<MemoryStore>,
    /// Ranking reads still to be interfered with
    remaining: Arc<AtomicU32>,
    /// Ranking reads seen
    reads: Arc<AtomicU32>,
    victim: String,
}

struct InterferingSession {
    session: MemorySession,
    inner: Arc<MemoryStore>,
    remaining: Arc<AtomicU32>,
    reads: Arc<AtomicU32>,
    victim: String,
}

#[async_trait]
impl Store for Interfering {
    type Session = InterferingSession;

    async fn session(&self) -> Result<InterferingSession> {
        Ok(InterferingSession {
            session: self.inner.session().await?,
            inner: self.inner.clone(),
            remaining: self.remaining.clone(),
            reads: self.reads.clone(),
            victim: self.victim.clone(),
        })
    }
}

#[async_trait]
impl Session for InterferingSession {
    async fn ping(&mut self) -> Result<()> {
        self.session.ping().await
    }

    async fn field_set(&mut self, key: &str) -> Result<FieldSet> {
        self.session.field_set(key).await
    }

    async fn rank_range(
        &mut self,
        index: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>> {
        let ranked = self.session.rank_range(index, start, stop).await?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let interfere = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interfere {
            let keys = Keyspace::default();
            let unit = AtomicUnit::IncrementLikes {
                record_key: keys.record_key(&self.victim),
                likes_field: "likes".into(),
                index_key: keys.ranking_key.clone(),
                member: self.victim.clone(),
            };
            self.inner.session().await?.evaluate(&unit).await?;
        }
        Ok(ranked)
    }

    async fn record_keys(&mut self, prefix: &str) -> Result<Vec<String>> {
        self.session.record_keys(prefix).await
    }

    async fn evaluate(&mut self, unit: &AtomicUnit) -> Result<Reply> {
        self.session.evaluate(unit).await
    }

    async fn watch(&mut self, key: &str) -> Result<()> {
        self.session.watch(key).await
    }

    async fn unwatch(&mut self) -> Result<()> {
        self.session.unwatch().await
    }

    async fn exec(&mut self, batch: &[Command]) -> Result<Option<Vec<Reply>>> {
        self.session.exec(batch).await
    }
}

struct Fixture {
    coordinator: Coordinator<Interfering>,
    /// Same data, without interference
    direct: Coordinator<MemoryStore>,
    reads: Arc<AtomicU32>,
}

async fn fixture(strategy: TopKStrategy, interference: u32, max_attempts: u32) -> Fixture {
    let inner = Arc::new(MemoryStore::default());
    let topk = TopKConfig {
        strategy,
        max_attempts,
    };
    let direct = Coordinator::new(inner.clone(), Keyspace::default(), topk.clone());
    seed_catalog(&direct, &demo_catalog()).await.unwrap();

    let reads = Arc::new(AtomicU32::new(0));
    let store = Interfering {
        inner,
        remaining: Arc::new(AtomicU32::new(interference)),
        reads: reads.clone(),
        victim: "1".into(),
    };
    Fixture {
        coordinator: Coordinator::new(Arc::new(store), Keyspace::default(), topk),
        direct,
        reads,
    }
}

#[tokio::test]
async fn test_read_restarts_until_ranking_is_stable() {
    let f = fixture(TopKStrategy::Optimistic, 3, 5).await;

    let top = f.coordinator.top(3).await.unwrap();

    // Three aborted attempts, then a clean one
    assert_eq!(f.reads.load(Ordering::SeqCst), 4);
    // Album 1 went from 8 to 11 likes and overtook album 4
    let ids: Vec<u64> = top.iter().map(|a| a.id.0).collect();
    let likes: Vec<u64> = top.iter().map(|a| a.likes).collect();
    assert_eq!(ids, vec![3, 1, 4]);
    assert_eq!(likes, vec![12, 11, 8]);
    assert_eq!(f.direct.get(AlbumId(1)).await.unwrap().likes, 11);
}

#[tokio::test]
async fn test_read_gives_up_after_max_attempts() {
    let f = fixture(TopKStrategy::Optimistic, u32::MAX, 5).await;

    match f.coordinator.top(3).await {
        Err(Error::Conflict { attempts }) => assert_eq!(attempts, 5),
        other => panic!("expected a conflict, got {other:?}"),
    }
    assert_eq!(f.reads.load(Ordering::SeqCst), 5);

    // The interfering likes all landed on both structures
    assert_eq!(f.direct.get(AlbumId(1)).await.unwrap().likes, 13);
    assert!(verify_catalog(&f.direct).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_scripted_read_needs_no_restart() {
    let f = fixture(TopKStrategy::Script, u32::MAX, 5).await;

    let top = f.coordinator.top(3).await.unwrap();
    assert_eq!(top.len(), 3);
    assert_eq!(f.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_ranking_is_read_once() {
    let inner = Arc::new(MemoryStore::default());
    let reads = Arc::new(AtomicU32::new(0));
    let store = Interfering {
        inner,
        remaining: Arc::new(AtomicU32::new(0)),
        reads: reads.clone(),
        victim: "1".into(),
    };
    let coordinator = Coordinator::new(
        Arc::new(store),
        Keyspace::default(),
        TopKConfig {
            strategy: TopKStrategy::Optimistic,
            max_attempts: 5,
        },
    );

    assert!(coordinator.top(3).await.unwrap().is_empty());
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}
