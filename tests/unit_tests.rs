use chrono::Utc;
use std::sync::Arc;
use tempfile::tempdir;
use trust_node::{
    query_engine::QueryEngine,
    storage::{SqliteStorage, Storage},
    types::{AgentIdentifier, Peer, TrustExperience},
};
use uuid::Uuid;

fn experience(key: &AgentIdentifier, pv_roi: f64, volume: f64, timestamp: chrono::DateTime<Utc>) -> TrustExperience {
    TrustExperience {
        id: Uuid::new_v4(),
        id_domain: key.id_domain.clone(),
        agent_id: key.agent_id.clone(),
        pv_roi,
        invested_volume: volume,
        timestamp,
        notes: Some("test experience".to_string()),
        data: None,
    }
}

#[tokio::test]
async fn test_storage_operations() {
    let dir = tempdir().unwrap();
    let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();
    let key = AgentIdentifier::new("test", "test_agent");

    let exp = experience(&key, 0.8, 100.0, Utc::now());
    storage.add_experience(exp.clone()).await.unwrap();

    let retrieved = storage.get_experiences(&key).await.unwrap();
    assert_eq!(retrieved.len(), 1);
    assert_eq!(retrieved[0].agent_id, key.agent_id);
    assert_eq!(retrieved[0].pv_roi, exp.pv_roi);
}

#[tokio::test]
async fn test_volume_weighted_calculations() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::new(&dir.path().join("test.db")).await.unwrap());
    let query_engine = QueryEngine::new(storage.clone());
    let key = AgentIdentifier::new("test", "target");

    // Fixed timestamp so the 0.1 forget_rate does not age any of these.
    let timestamp = Utc::now();

    for (pv_roi, volume) in [(0.5, 50.0), (0.9, 150.0), (0.3, 100.0)] {
        storage
            .add_experience(experience(&key, pv_roi, volume, timestamp))
            .await
            .unwrap();
    }

    let result = query_engine.local_score(&key, timestamp, 0.1).await.unwrap();

    let expected_roi = (0.5 * 50.0 + 0.9 * 150.0 + 0.3 * 100.0) / 300.0;
    assert!((result.expected_pv_roi - expected_roi).abs() < 0.01);
    assert_eq!(result.total_volume, 300.0);
    assert_eq!(result.data_points, 3);
}

#[tokio::test]
async fn test_peer_management() {
    let dir = tempdir().unwrap();
    let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();

    let peer = Peer {
        peer_id: "test_peer".to_string(),
        name: "Test Peer".to_string(),
        recommender_quality: 0.8,
        added_at: Utc::now(),
    };

    storage.add_peer(peer.clone()).await.unwrap();
    let peers = storage.get_peers().await.unwrap();

    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, peer.peer_id);
    assert_eq!(peers[0].recommender_quality, peer.recommender_quality);
}

#[tokio::test]
async fn test_local_score_ignores_unrelated_agents() {
    let dir = tempdir().unwrap();
    let storage = SqliteStorage::new(&dir.path().join("test.db")).await.unwrap();
    let target = AgentIdentifier::new("ethereum", "0xabc");
    let other = AgentIdentifier::new("ethereum", "0xdef");

    storage.add_experience(experience(&target, 1.1, 500.0, Utc::now())).await.unwrap();
    storage.add_experience(experience(&other, 0.2, 900.0, Utc::now())).await.unwrap();

    let found = storage.get_experiences(&target).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].pv_roi, 1.1);
}
