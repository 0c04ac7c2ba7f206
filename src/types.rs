use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for the subject of a trust query: `(id_domain, agent_id)`.
///
/// Both fields are opaque to the core — adapters upstream (not part of this
/// crate) are responsible for turning platform-specific identifiers (an
/// Ethereum address, an AliExpress seller id, ...) into this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentifier {
    pub id_domain: String,
    pub agent_id: String,
}

impl AgentIdentifier {
    pub fn new(id_domain: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id_domain: id_domain.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// A first-hand experience recorded by the local user about an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustExperience {
    pub id: Uuid,
    pub id_domain: String,
    pub agent_id: String,
    pub pv_roi: f64,
    pub invested_volume: f64,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
    pub data: Option<serde_json::Value>, // Adapter-specific data (e.g., tx links, purchase info)
}

impl TrustExperience {
    pub fn agent_key(&self) -> AgentIdentifier {
        AgentIdentifier::new(self.id_domain.clone(), self.agent_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub expected_pv_roi: f64,
    pub total_volume: f64,
    pub data_points: usize,
}

impl Default for TrustScore {
    fn default() -> Self {
        Self {
            expected_pv_roi: 1.0,
            total_volume: 0.0,
            data_points: 0,
        }
    }
}

/// An operator-curated peer: its network identity and how much its
/// recommendations should be trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    pub name: String,
    pub recommender_quality: f64,
    pub added_at: DateTime<Utc>,
}

impl Peer {
    /// Clamp recommender_quality into [-1, +1] on write (invariant 4).
    pub fn clamp_quality(&mut self) {
        self.recommender_quality = self.recommender_quality.clamp(-1.0, 1.0);
    }
}

/// The envelope under which a trust query is evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustQuery {
    pub agents: Vec<AgentIdentifier>,
    pub max_depth: u8,
    pub point_in_time: Option<DateTime<Utc>>,
    pub forget_rate: Option<f64>,
}

/// One agent's score within a `TrustResponse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentScore {
    pub id_domain: String,
    pub agent_id: String,
    pub score: TrustScore,
}

impl AgentScore {
    pub fn new(id_domain: impl Into<String>, agent_id: impl Into<String>, score: TrustScore) -> Self {
        Self {
            id_domain: id_domain.into(),
            agent_id: agent_id.into(),
            score,
        }
    }

    pub fn key(&self) -> AgentIdentifier {
        AgentIdentifier::new(self.id_domain.clone(), self.agent_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustResponse {
    pub scores: Vec<AgentScore>,
    pub timestamp: DateTime<Utc>,
}

/// Cached trust score from a peer's recommendation.
///
/// The key distinction between fields:
/// - `id_domain`/`agent_id`: the entity being evaluated
/// - `from_peer`: the peer who provided this trust score
///
/// Example: Alice (from_peer) recommends a trust score for Bob's Ethereum
/// address (id_domain="ethereum", agent_id="0x...").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTrustScore {
    pub id_domain: String,
    pub agent_id: String,
    pub score: TrustScore,
    pub from_peer: String,
    pub cached_at: DateTime<Utc>,
}

impl CachedTrustScore {
    pub fn key(&self) -> AgentIdentifier {
        AgentIdentifier::new(self.id_domain.clone(), self.agent_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustDataExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub experiences: Vec<TrustExperience>,
    pub peers: Vec<Peer>,
}

impl TrustDataExport {
    pub fn new(experiences: Vec<TrustExperience>, peers: Vec<Peer>) -> Self {
        Self {
            version: "1".to_string(),
            exported_at: Utc::now(),
            experiences,
            peers,
        }
    }
}
