use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use redir_lib::{RedirError, RedirResult, RootId, RootMapping};
use tokio::sync::RwLock;

/// Host-side description of one folder offered for sharing.
#[derive(Debug, Clone)]
pub struct RootConfig {
    pub name: String,
    pub base_path: PathBuf,
    pub case_sensitive: bool,
    pub read_only: bool,
}

/// A shared root. The descriptor is immutable while active; `base_path` never
/// changes while any handle under it is open.
pub struct RootEntry {
    pub root_id: RootId,
    pub name: String,
    pub base_path: PathBuf,
    pub case_sensitive: bool,
    pub read_only: bool,
    active: AtomicBool,
    live_handles: AtomicU64,
}

impl RootEntry {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> u64 {
        self.live_handles.load(Ordering::SeqCst)
    }

    pub(crate) fn retain_handle(&self) {
        self.live_handles.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_handle(&self) {
        let prev = self.live_handles.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            warn!("root {} handle count underflow", self.root_id.0);
        }
    }
}

/// Registry of shared roots, read-mostly and shared across all sessions.
/// Mutation (share/unshare) holds the lock briefly and never across host I/O.
///
/// Unshare policy: unsharing a root with live handles always succeeds. The
/// entry is removed from the table and marked inactive, so `resolve` and new
/// name-based operations fail with NoSuchRoot, while handles that still hold
/// the Arc keep working until the last of them closes.
pub struct RootTable {
    roots: RwLock<HashMap<RootId, Arc<RootEntry>>>,
    next_root_id: AtomicU32,
}

impl Default for RootTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RootTable {
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(HashMap::new()),
            next_root_id: AtomicU32::new(1),
        }
    }

    /// Register a host folder for guest access. The base path must exist and
    /// be a directory; it is canonicalized so later confinement checks work
    /// on a stable form.
    pub async fn share(&self, config: RootConfig) -> RedirResult<RootId> {
        let base_path = tokio::fs::canonicalize(&config.base_path)
            .await
            .map_err(|e| {
                RedirError::NoSuchRoot(format!(
                    "base path {} is not usable: {}",
                    config.base_path.display(),
                    e
                ))
            })?;
        let meta = tokio::fs::metadata(&base_path).await.map_err(RedirError::from)?;
        if !meta.is_dir() {
            return Err(RedirError::NoSuchRoot(format!(
                "base path {} is not a directory",
                base_path.display()
            )));
        }

        let root_id = RootId(self.next_root_id.fetch_add(1, Ordering::SeqCst));
        let entry = Arc::new(RootEntry {
            root_id,
            name: config.name,
            base_path,
            case_sensitive: config.case_sensitive,
            read_only: config.read_only,
            active: AtomicBool::new(true),
            live_handles: AtomicU64::new(0),
        });

        let mut roots = self.roots.write().await;
        info!(
            "share root {} -> {} (case_sensitive={}, read_only={})",
            root_id.0,
            entry.base_path.display(),
            entry.case_sensitive,
            entry.read_only
        );
        roots.insert(root_id, entry);
        Ok(root_id)
    }

    /// Remove a root from the table. Live handles keep their Arc and finish
    /// normally; the descriptor drops with the last of them.
    pub async fn unshare(&self, root_id: RootId) -> RedirResult<()> {
        let mut roots = self.roots.write().await;
        let entry = roots
            .remove(&root_id)
            .ok_or_else(|| RedirError::NoSuchRoot(format!("root {}", root_id.0)))?;
        entry.active.store(false, Ordering::SeqCst);
        info!(
            "unshare root {} ({} live handles retained)",
            root_id.0,
            entry.live_handles()
        );
        Ok(())
    }

    pub async fn resolve(&self, root_id: RootId) -> RedirResult<Arc<RootEntry>> {
        let roots = self.roots.read().await;
        let entry = roots
            .get(&root_id)
            .ok_or_else(|| RedirError::NoSuchRoot(format!("root {}", root_id.0)))?;
        if !entry.is_active() {
            return Err(RedirError::NoSuchRoot(format!("root {}", root_id.0)));
        }
        Ok(entry.clone())
    }

    pub async fn mappings(&self) -> Vec<RootMapping> {
        let roots = self.roots.read().await;
        let mut out: Vec<RootMapping> = roots
            .values()
            .map(|entry| RootMapping {
                root_id: entry.root_id,
                name: entry.name.clone(),
                writable: !entry.read_only,
                case_sensitive: entry.case_sensitive,
            })
            .collect();
        out.sort_by_key(|m| m.root_id.0);
        out
    }
}
