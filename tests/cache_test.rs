use chrono::{Duration, Utc};
use tempfile::tempdir;
use trust_node::{
    storage::{SqliteStorage, Storage},
    types::{AgentIdentifier, CachedTrustScore, TrustScore},
};

fn cached(key: &AgentIdentifier, from_peer: &str, score: TrustScore) -> CachedTrustScore {
    CachedTrustScore {
        id_domain: key.id_domain.clone(),
        agent_id: key.agent_id.clone(),
        score,
        from_peer: from_peer.to_string(),
        cached_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_trust_score_caching() {
    let dir = tempdir().unwrap();
    let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();
    let key = AgentIdentifier::new("test", "test_agent");

    let score = TrustScore {
        expected_pv_roi: 1.2,
        total_volume: 1000.0,
        data_points: 5,
    };
    storage.cache_put(cached(&key, "peer123", score)).await.unwrap();

    let retrieved = storage.cache_get(&key).await.unwrap();
    assert_eq!(retrieved.len(), 1);
    assert_eq!(retrieved[0].agent_id, key.agent_id);
    assert_eq!(retrieved[0].from_peer, "peer123");
    assert_eq!(retrieved[0].score.expected_pv_roi, 1.2);
    assert_eq!(retrieved[0].score.total_volume, 1000.0);
    assert_eq!(retrieved[0].score.data_points, 5);
}

#[tokio::test]
async fn test_multiple_peer_caching() {
    let dir = tempdir().unwrap();
    let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();
    let key = AgentIdentifier::new("test", "test_agent");

    for i in 0..3 {
        let score = TrustScore {
            expected_pv_roi: 1.0 + i as f64 * 0.1,
            total_volume: 100.0 * (i + 1) as f64,
            data_points: (i + 1) as usize,
        };
        storage.cache_put(cached(&key, &format!("peer{i}"), score)).await.unwrap();
    }

    let retrieved = storage.cache_get(&key).await.unwrap();
    assert_eq!(retrieved.len(), 3);

    for i in 0..3 {
        let peer_score = retrieved
            .iter()
            .find(|s| s.from_peer == format!("peer{i}"))
            .expect("should find peer score");

        assert_eq!(peer_score.score.expected_pv_roi, 1.0 + i as f64 * 0.1);
        assert_eq!(peer_score.score.total_volume, 100.0 * (i + 1) as f64);
        assert_eq!(peer_score.score.data_points, (i + 1) as usize);
    }
}

#[tokio::test]
async fn test_cache_update_replaces_same_peer_row() {
    let dir = tempdir().unwrap();
    let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();
    let key = AgentIdentifier::new("test", "test_agent");

    storage
        .cache_put(cached(
            &key,
            "peer123",
            TrustScore {
                expected_pv_roi: 1.0,
                total_volume: 100.0,
                data_points: 1,
            },
        ))
        .await
        .unwrap();

    storage
        .cache_put(cached(
            &key,
            "peer123",
            TrustScore {
                expected_pv_roi: 1.5,
                total_volume: 200.0,
                data_points: 2,
            },
        ))
        .await
        .unwrap();

    let retrieved = storage.cache_get(&key).await.unwrap();
    assert_eq!(retrieved.len(), 1);
    assert_eq!(retrieved[0].score.expected_pv_roi, 1.5);
    assert_eq!(retrieved[0].score.total_volume, 200.0);
    assert_eq!(retrieved[0].score.data_points, 2);
}

#[tokio::test]
async fn test_cache_eviction_is_scoped_by_cutoff() {
    let dir = tempdir().unwrap();
    let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();
    let key = AgentIdentifier::new("test", "test_agent");

    let mut stale = cached(&key, "peer_old", TrustScore::default());
    stale.cached_at = Utc::now() - Duration::hours(2);
    storage.cache_put(stale).await.unwrap();

    storage.cache_put(cached(&key, "peer_new", TrustScore::default())).await.unwrap();

    let evicted = storage.cache_evict_older_than(Utc::now() - Duration::hours(1)).await.unwrap();
    assert_eq!(evicted, 1);

    let remaining = storage.cache_get(&key).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].from_peer, "peer_new");
}
