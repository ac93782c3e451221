use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;

use super::error::{BrowserError, BrowserResult};

/// A throwaway Chromium user-data directory.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    id: String,
    path: PathBuf,
    created_at: DateTime<Utc>,
}

impl BrowserProfile {
    fn create(base_dir: &Path) -> BrowserResult<Self> {
        let id = Uuid::new_v4().to_string();
        let path = base_dir.join(&id);
        std::fs::create_dir_all(&path)
            .map_err(|err| BrowserError::Profile(format!("failed to create profile dir: {err}")))?;
        Ok(Self {
            id,
            path,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn release(&self) -> BrowserResult<()> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BrowserError::Profile(format!(
                "failed to remove profile {}: {err}",
                self.id
            ))),
        }
    }
}

/// Hands out profile directories and sweeps the ones a crashed process left
/// behind.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    base_dir: PathBuf,
    ttl: Duration,
}

impl ProfileManager {
    pub fn new<P: AsRef<Path>>(base_dir: P, ttl: Duration) -> BrowserResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to create profile base dir: {err}"))
        })?;
        Ok(Self { base_dir, ttl })
    }

    pub fn from_config(config: &EngineConfig) -> BrowserResult<Self> {
        let ttl = Duration::from_secs(config.chromium.profile_ttl_hours.saturating_mul(3600));
        Self::new(config.profiles_dir(), ttl)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn allocate(&self) -> BrowserResult<BrowserProfile> {
        BrowserProfile::create(&self.base_dir)
    }

    /// Removes profile directories untouched for longer than the TTL.
    /// Returns how many were removed.
    pub fn cleanup_expired(&self) -> BrowserResult<usize> {
        let now = SystemTime::now();
        let entries = std::fs::read_dir(&self.base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to list profile directory: {err}"))
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO));
            match age {
                Ok(age) if age > self.ttl => match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "removed expired profile");
                        removed += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to remove expired profile")
                    }
                },
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read profile metadata")
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_and_release() {
        let dir = tempdir().unwrap();
        let manager = ProfileManager::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let profile = manager.allocate().unwrap();
        assert!(profile.path().is_dir());
        assert!(profile.path().starts_with(dir.path()));
        profile.release().unwrap();
        assert!(!profile.path().exists());
        profile.release().unwrap();
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let dir = tempdir().unwrap();
        let fresh = ProfileManager::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let profile = fresh.allocate().unwrap();
        assert_eq!(fresh.cleanup_expired().unwrap(), 0);
        assert!(profile.path().exists());

        let eager = ProfileManager::new(dir.path(), Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(eager.cleanup_expired().unwrap(), 1);
        assert!(!profile.path().exists());
    }
}
