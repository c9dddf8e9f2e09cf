//! C7: isolates on-disk browser data per session and periodically sweeps
//! away anything left behind by crashed teardowns.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::error::StreamResult;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_AGE: chrono::Duration = chrono::Duration::hours(24);

/// Allocates and tears down per-session data directories under a single base
/// directory. Distinct from any per-user persistent profile the caller might
/// also maintain: this manager only owns the per-session temporary copy.
pub struct ProfileManager {
    base_dir: PathBuf,
}

impl ProfileManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(sanitize(session_id))
    }

    /// Creates a fresh, empty directory for `session_id`. Idempotent: an
    /// already-existing directory is left as-is.
    pub async fn allocate(&self, session_id: &str) -> StreamResult<PathBuf> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            crate::error::StreamError::InjectionRejected(format!(
                "failed to allocate profile dir {}: {err}",
                dir.display()
            ))
        })?;
        Ok(dir)
    }

    /// Removes a session's directory tree. Missing directories are not an
    /// error; cleanup failures are the caller's concern to log.
    pub async fn teardown(&self, session_id: &str) -> std::io::Result<()> {
        let dir = self.session_dir(session_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Starts a periodic background sweep that removes directories under the
    /// base dir older than `max_age`, regardless of whether a clean
    /// `teardown` ever ran for them.
    pub fn spawn_sweeper(self: std::sync::Arc<Self>, max_age: Option<chrono::Duration>) {
        let max_age = max_age.unwrap_or(DEFAULT_MAX_AGE);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(err) = self.sweep_stale(max_age).await {
                    tracing::warn!(error = %err, "profile directory sweep failed");
                }
            }
        });
    }

    async fn sweep_stale(&self, max_age: chrono::Duration) -> std::io::Result<()> {
        if !self.base_dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        let now = Utc::now();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_dir() {
                continue;
            }
            let modified = metadata.modified().ok().map(chrono::DateTime::<Utc>::from);
            let Some(modified) = modified else {
                continue;
            };
            if now - modified > max_age {
                let path = entry.path();
                if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "failed to sweep stale profile dir");
                }
            }
        }
        Ok(())
    }
}

/// Keeps a session-id from escaping the base directory via path components.
fn sanitize(session_id: &str) -> &str {
    Path::new(session_id)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("invalid-session")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_then_teardown_round_trips() {
        let base = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(base.path());
        let dir = manager.allocate("visual-abc").await.unwrap();
        assert!(dir.exists());
        manager.teardown("visual-abc").await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn teardown_of_missing_dir_is_not_an_error() {
        let base = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(base.path());
        assert!(manager.teardown("never-existed").await.is_ok());
    }

    #[test]
    fn sanitize_strips_path_traversal() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("visual-abc"), "visual-abc");
    }
}
