use anyhow::{Context, Result};
use libp2p::identity::Keypair;
use std::path::Path;
use tracing::info;

/// Load the node's ed25519 keypair from `<data-dir>/<user>.key`, generating
/// and persisting a fresh one on first run.
///
/// This gives the node a `peer_id` that is stable across restarts (spec
/// §4.4: "stable keypair, derived/persisted per-user").
pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let bytes = std::fs::read(path).with_context(|| format!("reading keypair at {}", path.display()))?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .with_context(|| format!("decoding keypair at {}", path.display()))?;
        info!("Loaded existing identity from {}", path.display());
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair.to_protobuf_encoding().context("encoding new keypair")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, encoded).with_context(|| format!("writing keypair at {}", path.display()))?;
    info!("Generated new identity, persisted to {}", path.display());
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_and_reloads_same_identity() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("alice.key");

        let first = load_or_generate(&path)?;
        let second = load_or_generate(&path)?;

        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
        Ok(())
    }
}
