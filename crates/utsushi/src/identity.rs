//! Participant identity
//!
//! Each participant is an Ed25519 key. Its public half is the [`PeerId`]
//! other peers see; the secret half is kept in a 32-byte key file so a
//! device keeps its identity across restarts.

use anyhow::{Context, Result};
use iroh::SecretKey;
use std::path::Path;
use tracing::info;

use crate::peer::PeerId;

#[derive(Clone)]
pub struct Identity {
    secret: SecretKey,
}

impl Identity {
    /// A fresh identity that is never written to disk
    pub fn ephemeral() -> Self {
        Self {
            secret: SecretKey::generate(&mut rand::rng()),
        }
    }

    /// Load the key at `path`, or generate one and save it there
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::ephemeral();
        identity.save(path)?;
        info!("Generated new identity key at {}", path.display());
        Ok(identity)
    }

    /// Persistent when `path` is given, otherwise ephemeral
    pub fn from_key_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_or_generate(path),
            None => Ok(Self::ephemeral()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read key file {}", path.display()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid key file length, expected 32 bytes"))?;
        Ok(Self {
            secret: SecretKey::from_bytes(&bytes),
        })
    }

    /// Write the secret key, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.secret.to_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.secret.public())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ephemeral_identities_differ() {
        assert_ne!(Identity::ephemeral().peer_id(), Identity::ephemeral().peer_id());
    }

    #[test]
    fn key_file_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys/streamer.key");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::metadata(&path).unwrap().permissions();
            assert_eq!(perms.mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn short_key_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(Identity::load(&path).is_err());
    }
}
