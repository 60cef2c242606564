// =============================================================================
// Indicator State Store — per-session crash recovery with atomic save
// =============================================================================
//
// Only indicator state is persisted: SAR needs its (trend, ep, sar, af)
// tuple and the CCI needs a trailing value window to answer crossing queries
// immediately after a restart. Positions are deliberately NOT persisted —
// the exchange is the source of truth and the first sync recovers them.
//
// Persistence uses a tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::indicators::SarState;

/// Everything a session needs to resume its indicators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    #[serde(default)]
    pub sar: Option<SarState>,
    #[serde(default)]
    pub cci_history: Vec<f64>,
}

/// Directory-backed store, one JSON file per session.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        // Session ids come from an external platform — keep only filename-safe
        // characters so a crafted id cannot escape the state dir.
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Persist `snapshot` atomically (write to `.tmp`, then rename).
    pub fn save(&self, user_id: &str, snapshot: &IndicatorSnapshot) -> Result<()> {
        let path = self.path_for(user_id);
        let content = serde_json::to_string_pretty(snapshot)
            .context("failed to serialise indicator snapshot")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        debug!(user_id, path = %path.display(), "indicator state saved");
        Ok(())
    }

    /// Best-effort load. Missing or unreadable snapshots simply start fresh.
    pub fn load(&self, user_id: &str) -> Option<IndicatorSnapshot> {
        let path = self.path_for(user_id);
        let content = std::fs::read_to_string(&path).ok()?;

        match serde_json::from_str(&content) {
            Ok(snapshot) => {
                debug!(user_id, path = %path.display(), "indicator state loaded");
                Some(snapshot)
            }
            Err(e) => {
                warn!(user_id, error = %e, "corrupt indicator snapshot ignored");
                None
            }
        }
    }

    /// Remove a session's snapshot. Missing files are fine.
    pub fn remove(&self, user_id: &str) {
        let path = self.path_for(user_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(user_id, error = %e, "failed to remove indicator snapshot");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> StateStore {
        let dir = std::env::temp_dir().join(format!("hedgegrid-test-{}", uuid::Uuid::new_v4()));
        StateStore::open(dir).unwrap()
    }

    #[test]
    fn save_load_round_trip() {
        let store = temp_store();
        let snapshot = IndicatorSnapshot {
            sar: Some(SarState {
                trend: 1,
                ep: 105.5,
                sar: 99.5,
                af: 0.04,
            }),
            cci_history: vec![-12.0, 34.5, 110.0],
        };

        store.save("user-1", &snapshot).unwrap();
        let loaded = store.load("user-1").unwrap();

        let sar = loaded.sar.unwrap();
        assert_eq!(sar.trend, 1);
        assert!((sar.ep - 105.5).abs() < 1e-12);
        assert!((sar.af - 0.04).abs() < 1e-12);
        assert_eq!(loaded.cci_history, snapshot.cci_history);
    }

    #[test]
    fn load_missing_returns_none() {
        let store = temp_store();
        assert!(store.load("nobody").is_none());
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let store = temp_store();
        std::fs::write(store.path_for("user-1"), "not json").unwrap();
        assert!(store.load("user-1").is_none());
    }

    #[test]
    fn hostile_user_id_stays_inside_the_dir() {
        let store = temp_store();
        let path = store.path_for("../../etc/passwd");
        assert!(path.starts_with(&store.dir));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn remove_is_idempotent() {
        let store = temp_store();
        store.save("user-1", &IndicatorSnapshot::default()).unwrap();
        store.remove("user-1");
        store.remove("user-1");
        assert!(store.load("user-1").is_none());
    }
}
