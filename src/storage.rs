use crate::error::CoreError;
use crate::types::{AgentIdentifier, CachedTrustScore, Peer, TrustDataExport, TrustExperience};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Pool, Sqlite};
use std::path::Path;
use uuid::Uuid;

/// Durable relational store for experiences, peers, and cached peer scores
/// (spec §4.2). All operations are individually durable on return; the only
/// multi-statement transaction is `import` with `overwrite = true`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn add_experience(&self, experience: TrustExperience) -> Result<(), CoreError>;
    async fn get_experiences(&self, key: &AgentIdentifier) -> Result<Vec<TrustExperience>>;
    async fn get_all_experiences(&self) -> Result<Vec<TrustExperience>>;
    async fn remove_experience(&self, experience_id: &str) -> Result<()>;

    async fn add_peer(&self, peer: Peer) -> Result<(), CoreError>;
    async fn get_peers(&self) -> Result<Vec<Peer>>;
    async fn update_peer_quality(&self, peer_id: &str, quality: f64) -> Result<(), CoreError>;
    async fn remove_peer(&self, peer_id: &str) -> Result<()>;

    async fn cache_put(&self, cached: CachedTrustScore) -> Result<()>;
    async fn cache_get(&self, key: &AgentIdentifier) -> Result<Vec<CachedTrustScore>>;
    async fn cache_evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn export(&self) -> Result<TrustDataExport>;
    async fn import(&self, data: TrustDataExport, overwrite: bool) -> Result<()>;
}

pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

impl SqliteStorage {
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating data directory {}", parent.display()))?;
            }
        }

        let db_url = if path.as_os_str() == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path.display())
        };
        let pool = SqlitePool::connect(&db_url)
            .await
            .with_context(|| format!("opening store at {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS experiences (
                id TEXT PRIMARY KEY,
                id_domain TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                pv_roi REAL NOT NULL,
                invested_volume REAL NOT NULL,
                timestamp TEXT NOT NULL,
                notes TEXT,
                data TEXT, -- JSON data from adapters
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_experiences_agent ON experiences(id_domain, agent_id)"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_experiences_timestamp ON experiences(timestamp)"#)
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                peer_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                recommender_quality REAL NOT NULL DEFAULT 0.5,
                added_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_scores (
                id_domain TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                expected_pv_roi REAL NOT NULL,
                total_volume REAL NOT NULL,
                data_points INTEGER NOT NULL,
                from_peer TEXT NOT NULL,
                cached_at TEXT NOT NULL,
                PRIMARY KEY (id_domain, agent_id, from_peer)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_cached_scores_agent ON cached_scores(id_domain, agent_id)"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_cached_scores_cached_at ON cached_scores(cached_at)"#)
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct ExperienceRow {
    id: String,
    id_domain: String,
    agent_id: String,
    pv_roi: f64,
    invested_volume: f64,
    timestamp: String,
    notes: Option<String>,
    data: Option<String>,
}

impl TryFrom<ExperienceRow> for TrustExperience {
    type Error = anyhow::Error;

    fn try_from(row: ExperienceRow) -> Result<Self> {
        Ok(TrustExperience {
            id: Uuid::parse_str(&row.id)?,
            id_domain: row.id_domain,
            agent_id: row.agent_id,
            pv_roi: row.pv_roi,
            invested_volume: row.invested_volume,
            timestamp: DateTime::parse_from_rfc3339(&row.timestamp)?.with_timezone(&Utc),
            notes: row.notes,
            data: row.data.and_then(|d| serde_json::from_str(&d).ok()),
        })
    }
}

#[derive(sqlx::FromRow)]
struct PeerRow {
    peer_id: String,
    name: String,
    recommender_quality: f64,
    added_at: String,
}

impl TryFrom<PeerRow> for Peer {
    type Error = anyhow::Error;

    fn try_from(row: PeerRow) -> Result<Self> {
        Ok(Peer {
            peer_id: row.peer_id,
            name: row.name,
            recommender_quality: row.recommender_quality,
            added_at: DateTime::parse_from_rfc3339(&row.added_at)?.with_timezone(&Utc),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CachedScoreRow {
    id_domain: String,
    agent_id: String,
    expected_pv_roi: f64,
    total_volume: f64,
    data_points: i64,
    from_peer: String,
    cached_at: String,
}

impl TryFrom<CachedScoreRow> for CachedTrustScore {
    type Error = anyhow::Error;

    fn try_from(row: CachedScoreRow) -> Result<Self> {
        Ok(CachedTrustScore {
            id_domain: row.id_domain,
            agent_id: row.agent_id,
            score: crate::types::TrustScore {
                expected_pv_roi: row.expected_pv_roi,
                total_volume: row.total_volume,
                data_points: row.data_points as usize,
            },
            from_peer: row.from_peer,
            cached_at: DateTime::parse_from_rfc3339(&row.cached_at)?.with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn add_experience(&self, experience: TrustExperience) -> Result<(), CoreError> {
        let data_json = experience
            .data
            .as_ref()
            .map(|d| serde_json::to_string(d).unwrap_or_else(|_| "null".to_string()));

        let result = sqlx::query(
            r#"
            INSERT INTO experiences (id, id_domain, agent_id, pv_roi, invested_volume, timestamp, notes, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(experience.id.to_string())
        .bind(&experience.id_domain)
        .bind(&experience.agent_id)
        .bind(experience.pv_roi)
        .bind(experience.invested_volume)
        .bind(experience.timestamp.to_rfc3339())
        .bind(&experience.notes)
        .bind(&data_json)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(CoreError::conflict(format!("experience {} already exists", experience.id)))
            }
            Err(e) => Err(CoreError::Internal(e.into())),
        }
    }

    async fn get_experiences(&self, key: &AgentIdentifier) -> Result<Vec<TrustExperience>> {
        let rows = sqlx::query_as::<_, ExperienceRow>(
            r#"
            SELECT id, id_domain, agent_id, pv_roi, invested_volume, timestamp, notes, data
            FROM experiences
            WHERE id_domain = ?1 AND agent_id = ?2
            ORDER BY timestamp DESC
            "#,
        )
        .bind(&key.id_domain)
        .bind(&key.agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TrustExperience::try_from).collect()
    }

    async fn get_all_experiences(&self) -> Result<Vec<TrustExperience>> {
        let rows = sqlx::query_as::<_, ExperienceRow>(
            r#"
            SELECT id, id_domain, agent_id, pv_roi, invested_volume, timestamp, notes, data
            FROM experiences
            ORDER BY timestamp DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TrustExperience::try_from).collect()
    }

    async fn remove_experience(&self, experience_id: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM experiences WHERE id = ?1"#)
            .bind(experience_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_peer(&self, mut peer: Peer) -> Result<(), CoreError> {
        peer.clamp_quality();
        let result = sqlx::query(
            r#"
            INSERT INTO peers (peer_id, name, recommender_quality, added_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&peer.peer_id)
        .bind(&peer.name)
        .bind(peer.recommender_quality)
        .bind(peer.added_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(CoreError::conflict(format!("peer {} already exists", peer.peer_id)))
            }
            Err(e) => Err(CoreError::Internal(e.into())),
        }
    }

    async fn get_peers(&self) -> Result<Vec<Peer>> {
        let rows = sqlx::query_as::<_, PeerRow>(
            r#"SELECT peer_id, name, recommender_quality, added_at FROM peers ORDER BY added_at DESC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Peer::try_from).collect()
    }

    async fn update_peer_quality(&self, peer_id: &str, quality: f64) -> Result<(), CoreError> {
        let clamped = quality.clamp(-1.0, 1.0);
        let result = sqlx::query(
            r#"UPDATE peers SET recommender_quality = ?1, updated_at = CURRENT_TIMESTAMP WHERE peer_id = ?2"#,
        )
        .bind(clamped)
        .bind(peer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Internal(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("peer {peer_id} not found")));
        }
        Ok(())
    }

    async fn remove_peer(&self, peer_id: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM peers WHERE peer_id = ?1"#)
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cache_put(&self, cached: CachedTrustScore) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cached_scores
            (id_domain, agent_id, expected_pv_roi, total_volume, data_points, from_peer, cached_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&cached.id_domain)
        .bind(&cached.agent_id)
        .bind(cached.score.expected_pv_roi)
        .bind(cached.score.total_volume)
        .bind(cached.score.data_points as i64)
        .bind(&cached.from_peer)
        .bind(cached.cached_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cache_get(&self, key: &AgentIdentifier) -> Result<Vec<CachedTrustScore>> {
        let rows = sqlx::query_as::<_, CachedScoreRow>(
            r#"
            SELECT id_domain, agent_id, expected_pv_roi, total_volume, data_points, from_peer, cached_at
            FROM cached_scores
            WHERE id_domain = ?1 AND agent_id = ?2
            ORDER BY cached_at DESC
            "#,
        )
        .bind(&key.id_domain)
        .bind(&key.agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CachedTrustScore::try_from).collect()
    }

    async fn cache_evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM cached_scores WHERE cached_at < ?1"#)
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn export(&self) -> Result<TrustDataExport> {
        let experiences = self.get_all_experiences().await?;
        let peers = self.get_peers().await?;
        Ok(TrustDataExport::new(experiences, peers))
    }

    async fn import(&self, data: TrustDataExport, overwrite: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if overwrite {
            sqlx::query("DELETE FROM experiences").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM peers").execute(&mut *tx).await?;
        }

        for experience in &data.experiences {
            let data_json = experience
                .data
                .as_ref()
                .map(|d| serde_json::to_string(d).unwrap_or_else(|_| "null".to_string()));

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO experiences
                (id, id_domain, agent_id, pv_roi, invested_volume, timestamp, notes, data)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(experience.id.to_string())
            .bind(&experience.id_domain)
            .bind(&experience.agent_id)
            .bind(experience.pv_roi)
            .bind(experience.invested_volume)
            .bind(experience.timestamp.to_rfc3339())
            .bind(&experience.notes)
            .bind(&data_json)
            .execute(&mut *tx)
            .await?;
        }

        for peer in &data.peers {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO peers (peer_id, name, recommender_quality, added_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(&peer.peer_id)
            .bind(&peer.name)
            .bind(peer.recommender_quality.clamp(-1.0, 1.0))
            .bind(peer.added_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
