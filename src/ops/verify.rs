//! Verify catalog integrity
//!
//! Reads the whole ranking index and every album record as one consistent
//! snapshot, then checks that each record's likes match its rank score and
//! that the two structures hold the same set of albums.

use crate::common::{Error, Result};
use crate::coordinator::{Album, Coordinator};
use crate::store::{Command, Session, Store};
use std::collections::HashMap;

pub async fn verify_catalog<S: Store>(coordinator: &Coordinator<S>) -> Result<VerifyReport> {
    tracing::info!("Starting catalog verification");

    let keys = coordinator.keyspace();
    let max_attempts = coordinator.topk().max_attempts;
    let mut session = coordinator.store().session().await?;

    for attempt in 1..=max_attempts {
        session.watch(&keys.ranking_key).await?;
        let ranked = session.rank_range(&keys.ranking_key, 0, -1).await?;
        let record_keys = session.record_keys(&keys.record_prefix).await?;

        let reads: Vec<Command> = record_keys
            .iter()
            .map(|key| Command::ReadFields { key: key.clone() })
            .collect();
        let Some(replies) = session.exec(&reads).await? else {
            tracing::warn!(attempt, "Ranking changed during verification, restarting");
            continue;
        };

        let mut report = VerifyReport {
            total_records: record_keys.len(),
            ranked: ranked.len(),
            ..VerifyReport::default()
        };
        let mut scores: HashMap<String, i64> = ranked.into_iter().collect();

        for (key, reply) in record_keys.iter().zip(replies) {
            let member = keys.member_of(key).unwrap_or(key);
            let album = reply
                .into_field_set()
                .ok_or_else(|| Error::Protocol(format!("read of {key} returned a malformed reply")))
                .and_then(Album::from_fields);
            let score = scores.remove(member);

            let album = match album {
                Ok(album) => album,
                Err(e) => {
                    report.corrupted += 1;
                    report.problems.push(format!("{key}: {e}"));
                    continue;
                }
            };
            match score {
                None => {
                    report.unranked_records += 1;
                    report.problems.push(format!("{key}: record has no ranking entry"));
                }
                Some(score) if i64::try_from(album.likes).ok() == Some(score) => {
                    report.healthy += 1;
                }
                Some(score) => {
                    report.score_mismatch += 1;
                    report.problems.push(format!(
                        "{key}: record has {} likes but ranks with {score}",
                        album.likes
                    ));
                }
            }
        }

        // Whatever is left in the ranking has no record behind it.
        let mut orphans: Vec<_> = scores.into_keys().collect();
        orphans.sort();
        for member in orphans {
            report.orphan_ranks += 1;
            report
                .problems
                .push(format!("{}: ranked but no record", keys.record_key(&member)));
        }

        if report.is_consistent() {
            tracing::info!("Verified {} albums", report.healthy);
        } else {
            tracing::warn!("Verification found {} problems", report.problems.len());
        }
        return Ok(report);
    }

    Err(Error::Conflict {
        attempts: max_attempts,
    })
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub total_records: usize,
    pub ranked: usize,
    pub healthy: usize,
    pub score_mismatch: usize,
    pub orphan_ranks: usize,
    pub unranked_records: usize,
    /// Records that could not be decoded as albums
    pub corrupted: usize,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.score_mismatch == 0
            && self.orphan_ranks == 0
            && self.unranked_records == 0
            && self.corrupted == 0
    }
}
