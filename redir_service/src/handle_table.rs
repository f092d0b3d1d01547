use std::path::PathBuf;
use std::sync::Arc;

use redir_lib::{HandleId, RedirError, RedirResult};
use tokio::fs::File;
use tokio::sync::Mutex;

use crate::dir_list::DirCursor;
use crate::root_table::RootEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

/// Host-side object behind a handle. Guarded by the per-handle mutex so
/// cursor-affecting state (file position, enumeration position) is serialized
/// across concurrent requests on the same handle.
pub enum HandleIo {
    File(File),
    Dir(DirCursor),
}

pub struct HandleEntry {
    pub id: HandleId,
    pub root: Arc<RootEntry>,
    pub kind: HandleKind,
    pub host_path: PathBuf,
    pub readable: bool,
    pub writable: bool,
    pub io: Mutex<HandleIo>,
}

struct Slot {
    generation: u32,
    entry: Option<Arc<HandleEntry>>,
}

/// Dense per-session handle arena with generation-tagged ids. A slot is only
/// reused after its generation is bumped, so a stale id from a closed handle
/// fails the generation check instead of aliasing the new occupant.
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate a slot and store the entry built around its id.
    pub fn insert(&mut self, build: impl FnOnce(HandleId) -> Arc<HandleEntry>) -> HandleId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = HandleId::from_parts(index, slot.generation);
        slot.entry = Some(build(id));
        id
    }

    pub fn get(&self, id: HandleId) -> RedirResult<Arc<HandleEntry>> {
        let slot = self
            .slots
            .get(id.index() as usize)
            .ok_or_else(|| invalid_handle(id))?;
        if slot.generation != id.generation() {
            return Err(invalid_handle(id));
        }
        slot.entry.clone().ok_or_else(|| invalid_handle(id))
    }

    /// Take the entry out and retire the id. A second remove with the same id
    /// fails the generation check and returns InvalidHandle.
    pub fn remove(&mut self, id: HandleId) -> RedirResult<Arc<HandleEntry>> {
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .ok_or_else(|| invalid_handle(id))?;
        if slot.generation != id.generation() {
            return Err(invalid_handle(id));
        }
        let entry = slot.entry.take().ok_or_else(|| invalid_handle(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        Ok(entry)
    }

    /// Empty the table for session teardown, retiring every live id.
    pub fn drain(&mut self) -> Vec<Arc<HandleEntry>> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                out.push(entry);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn invalid_handle(id: HandleId) -> RedirError {
    RedirError::InvalidHandle(format!("handle {:#x}", id.0))
}
