use crate::storage::Storage;
use crate::types::AgentIdentifier;
use crate::types::TrustScore;
use crate::valuation;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Computes the score a node reports for an agent at depth 0 — its own
/// experiences only (spec §4.3, "Local score").
///
/// Transitive (depth ≥ 1) queries are orchestrated by the Runtime, which
/// owns the P2P Layer this engine has no handle to; it issues depth-0
/// requests to peers, then blends the replies with `local_score` via
/// `valuation::combine`. This keeps the engine itself network-free and
/// trivially satisfies the "query(depth=0) emits no network traffic"
/// invariant.
pub struct QueryEngine<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> QueryEngine<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn local_score(
        &self,
        key: &AgentIdentifier,
        point_in_time: DateTime<Utc>,
        forget_rate: f64,
    ) -> anyhow::Result<TrustScore> {
        let experiences = self.storage.get_experiences(key).await?;
        Ok(valuation::aggregate(&experiences, point_in_time, forget_rate))
    }

    pub async fn local_scores(
        &self,
        keys: &[AgentIdentifier],
        point_in_time: DateTime<Utc>,
        forget_rate: f64,
    ) -> anyhow::Result<Vec<(AgentIdentifier, TrustScore)>> {
        let mut scores = Vec::with_capacity(keys.len());
        for key in keys {
            let score = self.local_score(key, point_in_time, forget_rate).await?;
            scores.push((key.clone(), score));
        }
        Ok(scores)
    }
}
