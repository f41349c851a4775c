//! Node configuration and identity files.
//!
//! Both files live in the node data directory as versioned JSON:
//! `identity.json` holds the peer keypair (created on first run) and
//! `config.json` holds cafes and delivery tuning.

use crate::crypto::keys::{IdentityKeyPair, PeerId, WrapPublicKey};
use crate::error::{Result, WeftError};
use crate::outbox::{CafePeer, DEFAULT_ENVELOPE_TTL_MS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Identity file name inside the data directory.
pub const IDENTITY_FILE: &str = "identity.json";

const CONFIG_VERSION: u32 = 1;
const IDENTITY_VERSION: u32 = 1;

/// A configured cafe: peer id plus the base64 wrap key requests are
/// encrypted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CafeConfig {
    pub id: String,
    pub wrap_key: String,
}

impl CafeConfig {
    /// Decodes into the outbox-facing form.
    pub fn to_cafe_peer(&self) -> Result<CafePeer> {
        Ok(CafePeer {
            id: PeerId::from_string(self.id.clone()),
            wrap_key: WrapPublicKey::from_base64(&self.wrap_key)?,
        })
    }
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub version: u32,
    /// Opaque account tag supplied by the embedding application.
    pub account: Option<String>,
    /// Cafes used for pinning and offline delivery.
    pub cafes: Vec<CafeConfig>,
    /// Direct-delivery TTL before envelopes move to the offline path.
    pub envelope_ttl_ms: u64,
    /// How often the node root is re-seeded and re-published.
    pub republish_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            account: None,
            cafes: Vec::new(),
            envelope_ttl_ms: DEFAULT_ENVELOPE_TTL_MS,
            republish_interval_secs: 3600,
        }
    }
}

impl NodeConfig {
    /// Loads the config from a data directory, writing defaults on first
    /// run.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Self::default();
            config.save(data_dir)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| WeftError::config(format!("Invalid config file: {}", e)))?;
        if config.version != CONFIG_VERSION {
            return Err(WeftError::config(format!(
                "Unsupported config version: {}",
                config.version
            )));
        }
        Ok(config)
    }

    /// Writes the config into a data directory.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)?;
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| WeftError::config(format!("Failed to encode config: {}", e)))?;
        fs::write(data_dir.join(CONFIG_FILE), raw)?;
        Ok(())
    }

    /// Decodes the configured cafes into outbox form.
    pub fn cafe_peers(&self) -> Result<Vec<CafePeer>> {
        self.cafes.iter().map(CafeConfig::to_cafe_peer).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    peer_id: String,
    signing_key: String,
}

/// Loads the node identity, generating and persisting one on first run.
pub fn load_or_create_identity(data_dir: &Path) -> Result<IdentityKeyPair> {
    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let raw = fs::read_to_string(&path)?;
        let parsed: IdentityFile = serde_json::from_str(&raw)
            .map_err(|e| WeftError::config(format!("Invalid identity file: {}", e)))?;
        if parsed.version != IDENTITY_VERSION {
            return Err(WeftError::config(format!(
                "Unsupported identity file version: {}",
                parsed.version
            )));
        }
        let identity = IdentityKeyPair::from_base64(&parsed.signing_key)?;
        if identity.peer_id().as_str() != parsed.peer_id {
            return Err(WeftError::config("Identity file peer id mismatch"));
        }
        return Ok(identity);
    }

    let identity = IdentityKeyPair::generate();
    let file = IdentityFile {
        version: IDENTITY_VERSION,
        peer_id: identity.peer_id().as_str().to_string(),
        signing_key: identity.to_base64()?,
    };
    fs::create_dir_all(data_dir)?;
    let raw = serde_json::to_string_pretty(&file)
        .map_err(|e| WeftError::config(format!("Failed to encode identity: {}", e)))?;
    fs::write(&path, raw)?;
    info!(peer_id = %identity.peer_id(), "new peer identity generated");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::WrapKeyPair;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults_written_on_first_load() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert!(dir.path().join(CONFIG_FILE).exists());

        // Second load reads the same file back.
        let again = NodeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_config_roundtrip_with_cafes() {
        let dir = TempDir::new().unwrap();
        let wrap = WrapKeyPair::generate();
        let mut config = NodeConfig::default();
        config.cafes.push(CafeConfig {
            id: "cafe-1".to_string(),
            wrap_key: wrap.public().to_base64(),
        });
        config.save(dir.path()).unwrap();

        let loaded = NodeConfig::load_or_default(dir.path()).unwrap();
        let peers = loaded.cafe_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id.as_str(), "cafe-1");
        assert_eq!(&peers[0].wrap_key, wrap.public());
    }

    #[test]
    fn test_bad_config_version_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = NodeConfig::default();
        config.version = 99;
        config.save(dir.path()).unwrap();
        assert!(NodeConfig::load_or_default(dir.path()).is_err());
    }

    #[test]
    fn test_identity_created_then_reloaded() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create_identity(dir.path()).unwrap();
        assert!(dir.path().join(IDENTITY_FILE).exists());

        let second = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.secret().as_bytes(), second.secret().as_bytes());
    }

    #[test]
    fn test_corrupt_identity_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(IDENTITY_FILE), "{not json").unwrap();
        assert!(load_or_create_identity(dir.path()).is_err());
    }
}
