use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use redir_lib::{
    ClientId, CreateParams, DirEntry, FileInfoPatch, FsProperties, GuestPath, HandleId,
    ObjectInfo, OpenDisposition, RedirError, RedirResult, RootId, RootMapping, TransferOutcome,
};
use tokio::fs::OpenOptions;
use tokio::sync::{Mutex, RwLock};

use crate::dir_list::DirCursor;
use crate::handle_table::{HandleEntry, HandleIo, HandleKind, HandleTable};
use crate::io_engine;
use crate::lock_mgr::LockManager;
use crate::path_translate;
use crate::root_table::{RootEntry, RootTable};

/// The boundary surface consumed by the transport layer. Every operation
/// carries the client id; name-based operations re-enter the path translator,
/// handle-based ones resolve through the client's handle table. No operation
/// panics; every failure is a status.
#[async_trait]
pub trait Redirector: Send + Sync {
    async fn client_connected(&self, client: &ClientId) -> RedirResult<()>;
    async fn client_disconnected(&self, client: &ClientId) -> RedirResult<()>;
    async fn list_roots(&self, client: &ClientId) -> RedirResult<Vec<RootMapping>>;

    async fn create(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
        params: &CreateParams,
    ) -> RedirResult<(HandleId, ObjectInfo)>;
    async fn close(&self, client: &ClientId, handle: HandleId) -> RedirResult<()>;

    async fn read(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u32,
    ) -> RedirResult<Vec<u8>>;
    async fn write(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        data: &[u8],
    ) -> RedirResult<u32>;
    async fn read_pages(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
        pages: &mut [Vec<u8>],
    ) -> TransferOutcome;
    async fn write_pages(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
        pages: &[Vec<u8>],
    ) -> TransferOutcome;
    async fn copy_file_part(
        &self,
        client: &ClientId,
        src_handle: HandleId,
        src_offset: u64,
        dst_handle: HandleId,
        dst_offset: u64,
        length: u64,
    ) -> TransferOutcome;

    async fn lock(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
        exclusive: bool,
    ) -> RedirResult<()>;
    async fn unlock(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
    ) -> RedirResult<()>;

    async fn list_dir(
        &self,
        client: &ClientId,
        handle: HandleId,
        max_entries: u32,
        filter: Option<&str>,
    ) -> RedirResult<(Vec<DirEntry>, bool)>;
    async fn rewind_dir(&self, client: &ClientId, handle: HandleId) -> RedirResult<()>;

    async fn flush(&self, client: &ClientId, handle: HandleId) -> RedirResult<()>;
    async fn set_file_size(
        &self,
        client: &ClientId,
        handle: HandleId,
        size: u64,
    ) -> RedirResult<()>;
    async fn query_file_info(
        &self,
        client: &ClientId,
        handle: HandleId,
    ) -> RedirResult<ObjectInfo>;
    async fn set_file_info(
        &self,
        client: &ClientId,
        handle: HandleId,
        patch: &FileInfoPatch,
    ) -> RedirResult<ObjectInfo>;
    async fn query_fs_info(
        &self,
        client: &ClientId,
        handle: HandleId,
    ) -> RedirResult<FsProperties>;
    async fn set_fs_info(&self, client: &ClientId, handle: HandleId) -> RedirResult<()>;

    async fn remove(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
        directory: bool,
        close_first: Option<HandleId>,
    ) -> RedirResult<()>;
    async fn rename(
        &self,
        client: &ClientId,
        root_id: RootId,
        src_path: &[u8],
        dst_path: &[u8],
        replace: bool,
    ) -> RedirResult<()>;
    async fn copy_file(
        &self,
        client: &ClientId,
        src_root: RootId,
        src_path: &[u8],
        dst_root: RootId,
        dst_path: &[u8],
    ) -> RedirResult<u64>;
    async fn read_link(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
    ) -> RedirResult<String>;
    async fn symlink(
        &self,
        client: &ClientId,
        root_id: RootId,
        link_path: &[u8],
        target_path: &[u8],
    ) -> RedirResult<ObjectInfo>;
    async fn query_path_info(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
    ) -> RedirResult<ObjectInfo>;
}

/// One connected client: its handle table and nothing else. Handles are never
/// visible across sessions.
pub struct ClientSession {
    pub client_id: ClientId,
    handles: Mutex<HandleTable>,
}

/// Session/client manager owning the root table view, the per-client handle
/// tables and the shared lock manager.
pub struct RedirectorService {
    roots: Arc<RootTable>,
    locks: Arc<LockManager>,
    sessions: RwLock<HashMap<ClientId, Arc<ClientSession>>>,
}

impl RedirectorService {
    pub fn new(roots: Arc<RootTable>) -> Self {
        Self {
            roots,
            locks: Arc::new(LockManager::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn roots(&self) -> &Arc<RootTable> {
        &self.roots
    }

    async fn session(&self, client: &ClientId) -> RedirResult<Arc<ClientSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(client)
            .cloned()
            .ok_or_else(|| RedirError::InvalidHandle(format!("client {} not connected", client.0)))
    }

    async fn handle_of(
        &self,
        client: &ClientId,
        handle: HandleId,
    ) -> RedirResult<Arc<HandleEntry>> {
        let session = self.session(client).await?;
        let table = session.handles.lock().await;
        table.get(handle)
    }

    async fn translate(
        &self,
        root_id: RootId,
        raw_path: &[u8],
    ) -> RedirResult<(Arc<RootEntry>, PathBuf)> {
        let root = self.roots.resolve(root_id).await?;
        let path = GuestPath::from_wire(raw_path)?;
        let host_path = path_translate::translate(&root, &path).await?;
        Ok((root, host_path))
    }

    /// Release everything a handle owns besides the host object itself; the
    /// descriptor closes when the last Arc drops, which lets an in-flight
    /// operation on the same handle finish first.
    async fn release_entry(&self, entry: &Arc<HandleEntry>) {
        self.locks.release_owner(&entry.host_path, entry.id).await;
        entry.root.release_handle();
    }

    async fn open_directory(
        &self,
        root: &Arc<RootEntry>,
        host_path: &Path,
        params: &CreateParams,
    ) -> RedirResult<ObjectInfo> {
        match params.disposition {
            OpenDisposition::OpenExisting => {}
            OpenDisposition::CreateOrTruncate => {
                return Err(RedirError::Unsupported(
                    "directories cannot be truncated".to_string(),
                ))
            }
            OpenDisposition::CreateExclusive => {
                if root.read_only {
                    return Err(read_only_root(root));
                }
                tokio::fs::create_dir(host_path).await?;
            }
            OpenDisposition::OpenOrCreate => {
                if tokio::fs::symlink_metadata(host_path).await.is_err() {
                    if root.read_only {
                        return Err(read_only_root(root));
                    }
                    tokio::fs::create_dir(host_path).await?;
                }
            }
        }
        let meta = tokio::fs::symlink_metadata(host_path).await?;
        if !meta.is_dir() {
            return Err(RedirError::NotFound(format!(
                "{} is not a directory",
                host_path.display()
            )));
        }
        Ok(ObjectInfo::from_metadata(&meta))
    }

    async fn open_file(
        &self,
        root: &Arc<RootEntry>,
        host_path: &Path,
        params: &CreateParams,
    ) -> RedirResult<(tokio::fs::File, ObjectInfo)> {
        if root.read_only {
            if params.access.wants_write() {
                return Err(read_only_root(root));
            }
            match params.disposition {
                OpenDisposition::CreateExclusive | OpenDisposition::CreateOrTruncate => {
                    return Err(read_only_root(root))
                }
                OpenDisposition::OpenOrCreate => {
                    if tokio::fs::symlink_metadata(host_path).await.is_err() {
                        return Err(read_only_root(root));
                    }
                }
                OpenDisposition::OpenExisting => {}
            }
        }

        let mut opts = OpenOptions::new();
        opts.read(params.access.wants_read());
        opts.write(params.access.wants_write());
        let file = match params.disposition {
            OpenDisposition::OpenExisting => opts.open(host_path).await?,
            OpenDisposition::CreateExclusive => {
                opts.write(true).create_new(true);
                opts.open(host_path).await?
            }
            OpenDisposition::CreateOrTruncate => {
                opts.write(true).create(true).truncate(true);
                opts.open(host_path).await?
            }
            OpenDisposition::OpenOrCreate => {
                // Plain open first so a read-only open of an existing file
                // does not demand host write permission.
                match opts.open(host_path).await {
                    Ok(file) => file,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        if root.read_only {
                            return Err(err.into());
                        }
                        let mut create_opts = OpenOptions::new();
                        create_opts
                            .read(params.access.wants_read())
                            .write(true)
                            .create(true);
                        create_opts.open(host_path).await?
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };
        let meta = file.metadata().await?;
        Ok((file, ObjectInfo::from_metadata(&meta)))
    }
}

fn read_only_root(root: &RootEntry) -> RedirError {
    RedirError::AccessDenied(format!("root {} is read-only", root.root_id.0))
}

#[async_trait]
impl Redirector for RedirectorService {
    async fn client_connected(&self, client: &ClientId) -> RedirResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(client) {
            return Err(RedirError::AlreadyExists(format!(
                "client {} is already connected",
                client.0
            )));
        }
        info!("client connected: {}", client.0);
        sessions.insert(
            client.clone(),
            Arc::new(ClientSession {
                client_id: client.clone(),
                handles: Mutex::new(HandleTable::new()),
            }),
        );
        Ok(())
    }

    /// Tear down a client: every remaining handle is closed, best-effort.
    /// The first flush failure is reported after all handles were released.
    async fn client_disconnected(&self, client: &ClientId) -> RedirResult<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(client).ok_or_else(|| {
                RedirError::InvalidHandle(format!("client {} not connected", client.0))
            })?
        };
        let drained = {
            let mut table = session.handles.lock().await;
            table.drain()
        };
        let count = drained.len();
        let mut first_err = None;
        for entry in drained {
            if entry.writable && entry.kind == HandleKind::File {
                if let Err(err) = io_engine::flush(&entry).await {
                    warn!(
                        "flush of handle {:#x} failed during teardown of {}: {}",
                        entry.id.0, client.0, err
                    );
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            self.release_entry(&entry).await;
        }
        info!("client disconnected: {} ({} handles closed)", client.0, count);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn list_roots(&self, client: &ClientId) -> RedirResult<Vec<RootMapping>> {
        self.session(client).await?;
        Ok(self.roots.mappings().await)
    }

    async fn create(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
        params: &CreateParams,
    ) -> RedirResult<(HandleId, ObjectInfo)> {
        let session = self.session(client).await?;
        let (root, host_path) = self.translate(root_id, path).await?;

        let (io, kind, info, writable) = if params.directory {
            let info = self.open_directory(&root, &host_path, params).await?;
            (
                HandleIo::Dir(DirCursor::new(host_path.clone())),
                HandleKind::Directory,
                info,
                false,
            )
        } else {
            let (file, info) = self.open_file(&root, &host_path, params).await?;
            (
                HandleIo::File(file),
                HandleKind::File,
                info,
                params.access.wants_write(),
            )
        };

        root.retain_handle();
        let mut table = session.handles.lock().await;
        let id = table.insert(|id| {
            Arc::new(HandleEntry {
                id,
                root: root.clone(),
                kind,
                host_path,
                readable: params.access.wants_read() || kind == HandleKind::Directory,
                writable,
                io: Mutex::new(io),
            })
        });
        Ok((id, info))
    }

    async fn close(&self, client: &ClientId, handle: HandleId) -> RedirResult<()> {
        let session = self.session(client).await?;
        let entry = {
            let mut table = session.handles.lock().await;
            table.remove(handle)?
        };
        self.release_entry(&entry).await;
        Ok(())
    }

    async fn read(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u32,
    ) -> RedirResult<Vec<u8>> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::read(&entry, offset, length).await
    }

    async fn write(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        data: &[u8],
    ) -> RedirResult<u32> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::write(&entry, &self.locks, offset, data).await
    }

    async fn read_pages(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
        pages: &mut [Vec<u8>],
    ) -> TransferOutcome {
        let entry = match self.handle_of(client, handle).await {
            Ok(entry) => entry,
            Err(err) => return TransferOutcome::failed(0, err),
        };
        io_engine::read_pages(&entry, offset, length, pages).await
    }

    async fn write_pages(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
        pages: &[Vec<u8>],
    ) -> TransferOutcome {
        let entry = match self.handle_of(client, handle).await {
            Ok(entry) => entry,
            Err(err) => return TransferOutcome::failed(0, err),
        };
        io_engine::write_pages(&entry, &self.locks, offset, length, pages).await
    }

    async fn copy_file_part(
        &self,
        client: &ClientId,
        src_handle: HandleId,
        src_offset: u64,
        dst_handle: HandleId,
        dst_offset: u64,
        length: u64,
    ) -> TransferOutcome {
        let src = match self.handle_of(client, src_handle).await {
            Ok(entry) => entry,
            Err(err) => return TransferOutcome::failed(0, err),
        };
        let dst = match self.handle_of(client, dst_handle).await {
            Ok(entry) => entry,
            Err(err) => return TransferOutcome::failed(0, err),
        };
        io_engine::copy_file_part(&src, &dst, &self.locks, src_offset, dst_offset, length).await
    }

    async fn lock(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
        exclusive: bool,
    ) -> RedirResult<()> {
        let entry = self.handle_of(client, handle).await?;
        self.locks
            .lock(&entry.host_path, entry.id, offset, length, exclusive)
            .await
    }

    async fn unlock(
        &self,
        client: &ClientId,
        handle: HandleId,
        offset: u64,
        length: u64,
    ) -> RedirResult<()> {
        let entry = self.handle_of(client, handle).await?;
        self.locks
            .unlock(&entry.host_path, entry.id, offset, length)
            .await
    }

    async fn list_dir(
        &self,
        client: &ClientId,
        handle: HandleId,
        max_entries: u32,
        filter: Option<&str>,
    ) -> RedirResult<(Vec<DirEntry>, bool)> {
        let entry = self.handle_of(client, handle).await?;
        let fold_case = !entry.root.case_sensitive;
        let mut guard = entry.io.lock().await;
        match &mut *guard {
            HandleIo::Dir(cursor) => {
                cursor
                    .next_page(max_entries as usize, filter, fold_case)
                    .await
            }
            HandleIo::File(_) => Err(RedirError::InvalidHandle(format!(
                "handle {:#x} is not a directory",
                entry.id.0
            ))),
        }
    }

    async fn rewind_dir(&self, client: &ClientId, handle: HandleId) -> RedirResult<()> {
        let entry = self.handle_of(client, handle).await?;
        let mut guard = entry.io.lock().await;
        match &mut *guard {
            HandleIo::Dir(cursor) => {
                cursor.rewind();
                Ok(())
            }
            HandleIo::File(_) => Err(RedirError::InvalidHandle(format!(
                "handle {:#x} is not a directory",
                entry.id.0
            ))),
        }
    }

    async fn flush(&self, client: &ClientId, handle: HandleId) -> RedirResult<()> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::flush(&entry).await
    }

    async fn set_file_size(
        &self,
        client: &ClientId,
        handle: HandleId,
        size: u64,
    ) -> RedirResult<()> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::set_file_size(&entry, size).await
    }

    async fn query_file_info(
        &self,
        client: &ClientId,
        handle: HandleId,
    ) -> RedirResult<ObjectInfo> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::query_file_info(&entry).await
    }

    async fn set_file_info(
        &self,
        client: &ClientId,
        handle: HandleId,
        patch: &FileInfoPatch,
    ) -> RedirResult<ObjectInfo> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::set_file_info(&entry, patch).await
    }

    async fn query_fs_info(
        &self,
        client: &ClientId,
        handle: HandleId,
    ) -> RedirResult<FsProperties> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::query_fs_info(&entry).await
    }

    async fn set_fs_info(&self, client: &ClientId, handle: HandleId) -> RedirResult<()> {
        let entry = self.handle_of(client, handle).await?;
        io_engine::set_fs_info(&entry).await
    }

    async fn remove(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
        directory: bool,
        close_first: Option<HandleId>,
    ) -> RedirResult<()> {
        self.session(client).await?;
        if let Some(handle) = close_first {
            self.close(client, handle).await?;
        }
        let (root, host_path) = self.translate(root_id, path).await?;
        if root.read_only {
            return Err(read_only_root(&root));
        }
        if directory {
            tokio::fs::remove_dir(&host_path).await?;
        } else {
            tokio::fs::remove_file(&host_path).await?;
        }
        Ok(())
    }

    /// Both paths are translated before anything is touched, so a bad
    /// destination leaves the source untouched.
    async fn rename(
        &self,
        client: &ClientId,
        root_id: RootId,
        src_path: &[u8],
        dst_path: &[u8],
        replace: bool,
    ) -> RedirResult<()> {
        self.session(client).await?;
        let (root, src_host) = self.translate(root_id, src_path).await?;
        let (_, dst_host) = self.translate(root_id, dst_path).await?;
        if root.read_only {
            return Err(read_only_root(&root));
        }
        if !replace && tokio::fs::symlink_metadata(&dst_host).await.is_ok() {
            return Err(RedirError::AlreadyExists(format!(
                "{} already exists",
                dst_host.display()
            )));
        }
        tokio::fs::rename(&src_host, &dst_host).await?;
        Ok(())
    }

    async fn copy_file(
        &self,
        client: &ClientId,
        src_root: RootId,
        src_path: &[u8],
        dst_root: RootId,
        dst_path: &[u8],
    ) -> RedirResult<u64> {
        self.session(client).await?;
        let (_, src_host) = self.translate(src_root, src_path).await?;
        let (dst_root_entry, dst_host) = self.translate(dst_root, dst_path).await?;
        if dst_root_entry.read_only {
            return Err(read_only_root(&dst_root_entry));
        }
        let bytes = tokio::fs::copy(&src_host, &dst_host).await?;
        Ok(bytes)
    }

    async fn read_link(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
    ) -> RedirResult<String> {
        self.session(client).await?;
        let (_, host_path) = self.translate(root_id, path).await?;
        let target = tokio::fs::read_link(&host_path).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn symlink(
        &self,
        client: &ClientId,
        root_id: RootId,
        link_path: &[u8],
        target_path: &[u8],
    ) -> RedirResult<ObjectInfo> {
        self.session(client).await?;
        let (root, link_host) = self.translate(root_id, link_path).await?;
        if root.read_only {
            return Err(read_only_root(&root));
        }
        // The target is confined like any other guest path, then stored
        // relative to the link's parent so the tree stays relocatable.
        let target = GuestPath::from_wire(target_path)?;
        let target_host = path_translate::translate(&root, &target).await?;
        let link_parent = link_host.parent().unwrap_or(&root.base_path);
        let relative = lexical_relative(link_parent, &target_host);

        make_symlink(&relative, &link_host).await?;
        let meta = tokio::fs::symlink_metadata(&link_host).await?;
        Ok(ObjectInfo::from_metadata(&meta))
    }

    async fn query_path_info(
        &self,
        client: &ClientId,
        root_id: RootId,
        path: &[u8],
    ) -> RedirResult<ObjectInfo> {
        self.session(client).await?;
        let (_, host_path) = self.translate(root_id, path).await?;
        let meta = tokio::fs::symlink_metadata(&host_path).await?;
        Ok(ObjectInfo::from_metadata(&meta))
    }
}

/// Relative path from `from_dir` to `to`, computed lexically. Both sides are
/// already-translated host paths under the same root.
fn lexical_relative(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let to_parts: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for part in &to_parts[common..] {
        out.push(part);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(unix)]
async fn make_symlink(target: &Path, link: &Path) -> RedirResult<()> {
    tokio::fs::symlink(target, link).await.map_err(RedirError::from)
}

#[cfg(windows)]
async fn make_symlink(target: &Path, link: &Path) -> RedirResult<()> {
    tokio::fs::symlink_file(target, link)
        .await
        .map_err(RedirError::from)
}

#[cfg(not(any(unix, windows)))]
async fn make_symlink(_target: &Path, _link: &Path) -> RedirResult<()> {
    Err(RedirError::Unsupported(
        "symlinks are not supported on this host".to_string(),
    ))
}
