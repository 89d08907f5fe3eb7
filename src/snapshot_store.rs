//! Dashboard state snapshot on disk.
//!
//! Saving is best-effort: errors are logged and swallowed so shutdown always
//! completes. A missing or unreadable snapshot on startup means "use the demo
//! data".
use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use crate::state::StoreSnapshot;

/// Write `snapshot` to `path` as pretty JSON, creating parent directories.
pub async fn save(path: &Path, snapshot: &StoreSnapshot) {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(dir).await {
            warn!(path = %path.display(), error = %e, "snapshot_store: failed to create directory");
            return;
        }
    }

    let content = match serde_json::to_vec_pretty(snapshot) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "snapshot_store: failed to serialise snapshot");
            return;
        }
    };

    if let Err(e) = fs::write(path, &content).await {
        warn!(path = %path.display(), error = %e, "snapshot_store: failed to write snapshot");
    } else {
        debug!(path = %path.display(), bytes = content.len(), "snapshot_store: saved");
    }
}

/// Read a snapshot written by [`save`]. `None` if absent or unreadable.
pub async fn load(path: &Path) -> Option<StoreSnapshot> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "snapshot_store: failed to read snapshot");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "snapshot_store: ignoring corrupt snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ControlOptions, DeviceStateStore};

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("iot_hub_{name}_{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn saved_snapshot_restores_device_state() {
        let dir = scratch_dir("snapshot");
        let path = dir.join("nested/state.json");

        let store = DeviceStateStore::with_demo_data();
        store.control_device("relay4", true, ControlOptions::default());
        save(&path, &store.snapshot()).await;

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, store.snapshot());

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_or_corrupt_snapshot_is_none() {
        let dir = scratch_dir("corrupt");
        let path = dir.join("state.json");
        assert!(load(&path).await.is_none());

        fs::create_dir_all(&dir).await.unwrap();
        fs::write(&path, b"{ not json").await.unwrap();
        assert!(load(&path).await.is_none());

        fs::remove_dir_all(&dir).await.unwrap();
    }
}
