use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;
use redir_lib::{HandleId, RedirError, RedirResult};
use tokio::sync::RwLock;

/// One advisory byte-range lock owned by a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub owner: HandleId,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
}

/// Advisory byte-range locks, keyed by the translated host path so every
/// handle family (handles over the same underlying file, across roots and
/// sessions) shares one record list. The overlap check is host-agnostic;
/// conflicting requests are denied, never queued. Nothing here guards raw
/// host-level access from outside this service.
#[derive(Default)]
pub struct LockManager {
    families: RwLock<HashMap<PathBuf, Vec<LockRecord>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant or deny a new range lock. A zero-length range conflicts with
    /// nothing and is granted without recording anything.
    pub async fn lock(
        &self,
        family: &Path,
        owner: HandleId,
        offset: u64,
        length: u64,
        exclusive: bool,
    ) -> RedirResult<()> {
        if length == 0 {
            return Ok(());
        }
        let mut families = self.families.write().await;
        let records = families.entry(family.to_path_buf()).or_default();
        for existing in records.iter() {
            if !ranges_overlap(existing.offset, existing.length, offset, length) {
                continue;
            }
            if exclusive || existing.exclusive {
                return Err(RedirError::LockConflict(format!(
                    "range [{}, {}) on {}",
                    offset,
                    offset + length,
                    family.display()
                )));
            }
        }
        records.push(LockRecord {
            owner,
            offset,
            length,
            exclusive,
        });
        debug!(
            "lock granted: {} [{}, {}) exclusive={}",
            family.display(),
            offset,
            offset + length,
            exclusive
        );
        Ok(())
    }

    /// Release a record matching the exact offset/length owned by the same
    /// handle. Partial-range unlock of a wider lock is not supported.
    pub async fn unlock(
        &self,
        family: &Path,
        owner: HandleId,
        offset: u64,
        length: u64,
    ) -> RedirResult<()> {
        let mut families = self.families.write().await;
        let records = match families.get_mut(family) {
            Some(v) => v,
            None => {
                return Err(RedirError::NotLocked(format!(
                    "no locks on {}",
                    family.display()
                )))
            }
        };
        let position = records
            .iter()
            .position(|r| r.owner == owner && r.offset == offset && r.length == length)
            .ok_or_else(|| {
                RedirError::NotLocked(format!(
                    "range [{}, {}) on {}",
                    offset,
                    offset.saturating_add(length),
                    family.display()
                ))
            })?;
        records.swap_remove(position);
        if records.is_empty() {
            families.remove(family);
        }
        Ok(())
    }

    /// Drop every record owned by a handle; called on close and disconnect.
    pub async fn release_owner(&self, family: &Path, owner: HandleId) {
        let mut families = self.families.write().await;
        if let Some(records) = families.get_mut(family) {
            records.retain(|r| r.owner != owner);
            if records.is_empty() {
                families.remove(family);
            }
        }
    }

    /// Cooperative pre-write check: a write conflicts with any overlapping
    /// record held by a different handle, shared or exclusive.
    pub async fn check_write(
        &self,
        family: &Path,
        owner: HandleId,
        offset: u64,
        length: u64,
    ) -> RedirResult<()> {
        if length == 0 {
            return Ok(());
        }
        let families = self.families.read().await;
        if let Some(records) = families.get(family) {
            for existing in records.iter() {
                if existing.owner != owner
                    && ranges_overlap(existing.offset, existing.length, offset, length)
                {
                    return Err(RedirError::LockConflict(format!(
                        "write [{}, {}) hits foreign lock on {}",
                        offset,
                        offset + length,
                        family.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn ranges_overlap(a_offset: u64, a_length: u64, b_offset: u64, b_length: u64) -> bool {
    a_offset < b_offset.saturating_add(b_length) && b_offset < a_offset.saturating_add(a_length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: u64) -> HandleId {
        HandleId(n)
    }

    #[tokio::test]
    async fn test_exclusive_overlap_denied() {
        let mgr = LockManager::new();
        let file = Path::new("/share/data.bin");
        mgr.lock(file, handle(1), 0, 100, true).await.unwrap();

        let denied = mgr.lock(file, handle(2), 50, 10, true).await;
        assert!(matches!(denied, Err(RedirError::LockConflict(_))));

        // Adjacent range is free.
        mgr.lock(file, handle(2), 100, 100, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_locks_coexist_and_block_exclusive() {
        let mgr = LockManager::new();
        let file = Path::new("/share/data.bin");
        mgr.lock(file, handle(1), 0, 10, false).await.unwrap();
        mgr.lock(file, handle(2), 5, 10, false).await.unwrap();

        let denied = mgr.lock(file, handle(3), 0, 1, true).await;
        assert!(matches!(denied, Err(RedirError::LockConflict(_))));
    }

    #[tokio::test]
    async fn test_unlock_requires_exact_match() {
        let mgr = LockManager::new();
        let file = Path::new("/share/data.bin");
        mgr.lock(file, handle(1), 0, 100, true).await.unwrap();

        let wrong = mgr.unlock(file, handle(1), 0, 50).await;
        assert!(matches!(wrong, Err(RedirError::NotLocked(_))));

        mgr.unlock(file, handle(1), 0, 100).await.unwrap();
        let again = mgr.unlock(file, handle(1), 0, 100).await;
        assert!(matches!(again, Err(RedirError::NotLocked(_))));
    }

    #[tokio::test]
    async fn test_write_check_respects_foreign_locks() {
        let mgr = LockManager::new();
        let file = Path::new("/share/data.bin");
        mgr.lock(file, handle(1), 0, 100, false).await.unwrap();

        assert!(mgr.check_write(file, handle(1), 0, 10).await.is_ok());
        assert!(mgr.check_write(file, handle(2), 0, 10).await.is_err());
        assert!(mgr.check_write(file, handle(2), 100, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_owner_drops_all_records() {
        let mgr = LockManager::new();
        let file = Path::new("/share/data.bin");
        mgr.lock(file, handle(1), 0, 10, true).await.unwrap();
        mgr.lock(file, handle(1), 20, 10, true).await.unwrap();
        mgr.release_owner(file, handle(1)).await;
        mgr.lock(file, handle(2), 0, 30, true).await.unwrap();
    }
}
