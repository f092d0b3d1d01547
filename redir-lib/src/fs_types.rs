use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::RedirError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootId(pub u32);

/// Opaque per-client handle. Packs a dense table index in the low 32 bits and
/// a generation tag in the high 32 bits so a stale id from a closed slot is
/// detected instead of aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn from_parts(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    pub fn index(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Platform-neutral object attributes returned by stat/list operations.
/// Timestamps are unix seconds; a platform without a creation time reports 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub kind: EntryKind,
    pub size: u64,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub readonly: bool,
}

impl ObjectInfo {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Self {
            kind,
            size: meta.len(),
            created: meta.created().map(unix_secs).unwrap_or(0),
            modified: meta.modified().map(unix_secs).unwrap_or(0),
            accessed: meta.accessed().map(unix_secs).unwrap_or(0),
            readonly: meta.permissions().readonly(),
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub info: ObjectInfo,
}

/// Volume-level properties of the filesystem backing a root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsProperties {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub block_size: u32,
    pub max_component_len: u32,
    pub case_sensitive: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn wants_write(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    pub fn wants_read(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenDisposition {
    /// Open an existing object (fails with NotFound if absent)
    OpenExisting,

    /// Create a new object exclusively (fails with AlreadyExists)
    CreateExclusive,

    /// Open if present, create otherwise
    OpenOrCreate,

    /// Create if absent, truncate existing content otherwise
    CreateOrTruncate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateParams {
    pub disposition: OpenDisposition,
    pub access: AccessMode,
    /// Open/create a directory instead of a regular file.
    pub directory: bool,
}

/// Attribute patch for set-file-info. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfoPatch {
    pub size: Option<u64>,
    pub modified: Option<u64>,
    pub accessed: Option<u64>,
    pub readonly: Option<bool>,
}

impl FileInfoPatch {
    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.modified.is_none()
            && self.accessed.is_none()
            && self.readonly.is_none()
    }
}

/// One shared root as reported to the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootMapping {
    pub root_id: RootId,
    pub name: String,
    pub writable: bool,
    pub case_sensitive: bool,
}

/// Result of a bulk transfer that may stop partway. A mid-transfer host
/// failure keeps the count of bytes already moved; the caller decides whether
/// partial completion is acceptable.
#[derive(Debug)]
pub struct TransferOutcome {
    pub transferred: u64,
    pub error: Option<RedirError>,
}

impl TransferOutcome {
    pub fn done(transferred: u64) -> Self {
        Self {
            transferred,
            error: None,
        }
    }

    pub fn failed(transferred: u64, error: RedirError) -> Self {
        Self {
            transferred,
            error: Some(error),
        }
    }

    /// Collapse into a plain result, dropping the partial count.
    pub fn into_result(self) -> Result<u64, RedirError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.transferred),
        }
    }
}
