use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, ZerolinkError};
use crate::peer::PeerId;

const IDENTITY_FILE: &str = "identity.json";

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    peer_id: PeerId,
}

/// Load this installation's peer id from `dir`, generating and saving one on first run.
pub fn load_or_create_identity(dir: &Path) -> Result<PeerId> {
    let path = dir.join(IDENTITY_FILE);

    if path.exists() {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StoredIdentity>(&content) {
                Ok(stored) => {
                    tracing::info!("Loaded peer id {}", stored.peer_id);
                    return Ok(stored.peer_id);
                }
                Err(e) => tracing::warn!("Failed to parse {}: {}", path.display(), e),
            },
            Err(e) => tracing::warn!("Failed to read {}: {}", path.display(), e),
        }
    }

    let peer_id = PeerId::new_random();
    fs::create_dir_all(dir)
        .map_err(|e| ZerolinkError::Storage(format!("create {}: {}", dir.display(), e)))?;
    let json = serde_json::to_string_pretty(&StoredIdentity { peer_id })
        .map_err(|e| ZerolinkError::Storage(e.to_string()))?;
    fs::write(&path, json)
        .map_err(|e| ZerolinkError::Storage(format!("write {}: {}", path.display(), e)))?;

    tracing::info!("Generated new peer id {}", peer_id);
    Ok(peer_id)
}
