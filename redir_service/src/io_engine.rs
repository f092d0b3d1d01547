use std::io::SeekFrom;

use log::warn;
use redir_lib::{
    FileInfoPatch, FsProperties, ObjectInfo, RedirError, RedirResult, TransferOutcome,
};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::MutexGuard;

use crate::handle_table::{HandleEntry, HandleIo};
use crate::lock_mgr::LockManager;

/// Chunk size for the cross-root copy loop.
const COPY_CHUNK_SIZE: usize = 128 * 1024;

fn not_a_file(entry: &HandleEntry) -> RedirError {
    RedirError::InvalidHandle(format!("handle {:#x} is not a file", entry.id.0))
}

fn file_of<'a>(
    entry: &HandleEntry,
    guard: &'a mut MutexGuard<'_, HandleIo>,
) -> RedirResult<&'a mut File> {
    match &mut **guard {
        HandleIo::File(file) => Ok(file),
        HandleIo::Dir(_) => Err(not_a_file(entry)),
    }
}

/// Positioned read. Short reads at end of file are success, not an error.
pub async fn read(entry: &HandleEntry, offset: u64, length: u32) -> RedirResult<Vec<u8>> {
    if !entry.readable {
        return Err(RedirError::AccessDenied(format!(
            "handle {:#x} was not opened for reading",
            entry.id.0
        )));
    }
    let mut guard = entry.io.lock().await;
    let file = file_of(entry, &mut guard)?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; length as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Positioned write. Checked against foreign advisory locks before any byte
/// is written.
pub async fn write(
    entry: &HandleEntry,
    locks: &LockManager,
    offset: u64,
    data: &[u8],
) -> RedirResult<u32> {
    ensure_writable(entry)?;
    locks
        .check_write(&entry.host_path, entry.id, offset, data.len() as u64)
        .await?;

    let mut guard = entry.io.lock().await;
    let file = file_of(entry, &mut guard)?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    Ok(data.len() as u32)
}

/// Paginated read: fill the supplied page buffers in order until `length`
/// bytes were read or the file ends. Each page is truncated to the bytes it
/// actually received; the outcome carries one accumulated count.
pub async fn read_pages(
    entry: &HandleEntry,
    offset: u64,
    length: u64,
    pages: &mut [Vec<u8>],
) -> TransferOutcome {
    if !entry.readable {
        return TransferOutcome::failed(
            0,
            RedirError::AccessDenied(format!(
                "handle {:#x} was not opened for reading",
                entry.id.0
            )),
        );
    }
    let mut guard = entry.io.lock().await;
    let file = match file_of(entry, &mut guard) {
        Ok(file) => file,
        Err(err) => return TransferOutcome::failed(0, err),
    };
    if let Err(err) = file.seek(SeekFrom::Start(offset)).await {
        return TransferOutcome::failed(0, err.into());
    }

    let mut transferred = 0u64;
    let mut remaining = length;
    for page in pages.iter_mut() {
        let want = (page.len() as u64).min(remaining) as usize;
        let mut filled = 0;
        while filled < want {
            match file.read(&mut page[filled..want]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => {
                    page.truncate(filled);
                    return TransferOutcome::failed(transferred + filled as u64, err.into());
                }
            }
        }
        page.truncate(filled);
        transferred += filled as u64;
        remaining -= filled as u64;
        if filled < want || remaining == 0 {
            break;
        }
    }
    TransferOutcome::done(transferred)
}

/// Paginated write: the equivalent sequence of host writes per page, one
/// accumulated count, partial progress preserved on mid-transfer failure.
pub async fn write_pages(
    entry: &HandleEntry,
    locks: &LockManager,
    offset: u64,
    length: u64,
    pages: &[Vec<u8>],
) -> TransferOutcome {
    if let Err(err) = ensure_writable(entry) {
        return TransferOutcome::failed(0, err);
    }
    if let Err(err) = locks
        .check_write(&entry.host_path, entry.id, offset, length)
        .await
    {
        return TransferOutcome::failed(0, err);
    }

    let mut guard = entry.io.lock().await;
    let file = match file_of(entry, &mut guard) {
        Ok(file) => file,
        Err(err) => return TransferOutcome::failed(0, err),
    };
    if let Err(err) = file.seek(SeekFrom::Start(offset)).await {
        return TransferOutcome::failed(0, err.into());
    }

    let mut transferred = 0u64;
    let mut remaining = length;
    for page in pages {
        let take = (page.len() as u64).min(remaining) as usize;
        match write_fully(file, &page[..take]).await {
            Ok(()) => {
                transferred += take as u64;
                remaining -= take as u64;
            }
            Err((written, err)) => {
                return TransferOutcome::failed(transferred + written, err);
            }
        }
        if remaining == 0 {
            break;
        }
    }
    TransferOutcome::done(transferred)
}

async fn write_fully(file: &mut File, data: &[u8]) -> Result<(), (u64, RedirError)> {
    let mut pos = 0;
    while pos < data.len() {
        match file.write(&data[pos..]).await {
            Ok(0) => {
                return Err((
                    pos as u64,
                    RedirError::DiskFull("write returned zero bytes".to_string()),
                ))
            }
            Ok(n) => pos += n,
            Err(err) => return Err((pos as u64, err.into())),
        }
    }
    Ok(())
}

/// Copy `length` bytes between two handles, possibly under different roots on
/// different host volumes. Read-then-write chunk loop; the outcome reports
/// the exact count moved before any failure, and stopping early at the source
/// end of file is not an error.
pub async fn copy_file_part(
    src: &HandleEntry,
    dst: &HandleEntry,
    locks: &LockManager,
    src_offset: u64,
    dst_offset: u64,
    length: u64,
) -> TransferOutcome {
    if !src.readable {
        return TransferOutcome::failed(
            0,
            RedirError::AccessDenied(format!(
                "handle {:#x} was not opened for reading",
                src.id.0
            )),
        );
    }
    if let Err(err) = ensure_writable(dst) {
        return TransferOutcome::failed(0, err);
    }
    if let Err(err) = locks
        .check_write(&dst.host_path, dst.id, dst_offset, length)
        .await
    {
        return TransferOutcome::failed(0, err);
    }

    let mut transferred = 0u64;
    let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
    while transferred < length {
        let want = ((length - transferred) as usize).min(COPY_CHUNK_SIZE);

        // Source and destination are never locked at the same time.
        let got = {
            let mut guard = src.io.lock().await;
            let file = match file_of(src, &mut guard) {
                Ok(file) => file,
                Err(err) => return TransferOutcome::failed(transferred, err),
            };
            if let Err(err) = file.seek(SeekFrom::Start(src_offset + transferred)).await {
                return TransferOutcome::failed(transferred, err.into());
            }
            let mut filled = 0;
            while filled < want {
                match file.read(&mut chunk[filled..want]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) => return TransferOutcome::failed(transferred, err.into()),
                }
            }
            filled
        };
        if got == 0 {
            break;
        }

        let mut guard = dst.io.lock().await;
        let file = match file_of(dst, &mut guard) {
            Ok(file) => file,
            Err(err) => return TransferOutcome::failed(transferred, err),
        };
        if let Err(err) = file.seek(SeekFrom::Start(dst_offset + transferred)).await {
            return TransferOutcome::failed(transferred, err.into());
        }
        match write_fully(file, &chunk[..got]).await {
            Ok(()) => transferred += got as u64,
            Err((written, err)) => {
                return TransferOutcome::failed(transferred + written, err);
            }
        }
    }
    TransferOutcome::done(transferred)
}

pub async fn set_file_size(entry: &HandleEntry, size: u64) -> RedirResult<()> {
    ensure_writable(entry)?;
    let mut guard = entry.io.lock().await;
    let file = file_of(entry, &mut guard)?;
    file.set_len(size).await?;
    Ok(())
}

/// Flush buffered file data to the host. A no-op for directory handles.
pub async fn flush(entry: &HandleEntry) -> RedirResult<()> {
    let mut guard = entry.io.lock().await;
    match &mut *guard {
        HandleIo::File(file) => {
            file.sync_all().await?;
            Ok(())
        }
        HandleIo::Dir(_) => Ok(()),
    }
}

pub async fn query_file_info(entry: &HandleEntry) -> RedirResult<ObjectInfo> {
    let meta = tokio::fs::symlink_metadata(&entry.host_path).await?;
    Ok(ObjectInfo::from_metadata(&meta))
}

/// Apply an attribute patch: size (files only), readonly flag, timestamps.
/// Returns the attributes after the change.
pub async fn set_file_info(entry: &HandleEntry, patch: &FileInfoPatch) -> RedirResult<ObjectInfo> {
    if entry.root.read_only {
        return Err(RedirError::AccessDenied(format!(
            "root {} is read-only",
            entry.root.root_id.0
        )));
    }
    if patch.is_empty() {
        return query_file_info(entry).await;
    }

    if let Some(size) = patch.size {
        set_file_size(entry, size).await?;
    }

    if let Some(readonly) = patch.readonly {
        let meta = tokio::fs::metadata(&entry.host_path).await?;
        let mut perms = meta.permissions();
        perms.set_readonly(readonly);
        tokio::fs::set_permissions(&entry.host_path, perms).await?;
    }

    if patch.modified.is_some() || patch.accessed.is_some() {
        let meta = tokio::fs::symlink_metadata(&entry.host_path).await?;
        let current = ObjectInfo::from_metadata(&meta);
        let mtime = patch.modified.unwrap_or(current.modified);
        let atime = patch.accessed.unwrap_or(current.accessed);
        filetime::set_file_times(
            &entry.host_path,
            filetime::FileTime::from_unix_time(atime as i64, 0),
            filetime::FileTime::from_unix_time(mtime as i64, 0),
        )
        .map_err(RedirError::from)?;
    }

    query_file_info(entry).await
}

/// Volume properties of the filesystem backing the handle's root.
pub async fn query_fs_info(entry: &HandleEntry) -> RedirResult<FsProperties> {
    let (total_bytes, free_bytes, block_size) = match volume_sizes(entry) {
        Ok(v) => v,
        Err(err) => {
            warn!(
                "volume size query failed for {}: {}",
                entry.root.base_path.display(),
                err
            );
            (0, 0, 0)
        }
    };
    Ok(FsProperties {
        total_bytes,
        free_bytes,
        block_size,
        max_component_len: 255,
        case_sensitive: entry.root.case_sensitive,
        read_only: entry.root.read_only,
    })
}

/// Volume-info writes are not supported by any current host; read-only roots
/// deny first.
pub async fn set_fs_info(entry: &HandleEntry) -> RedirResult<()> {
    if entry.root.read_only {
        return Err(RedirError::AccessDenied(format!(
            "root {} is read-only",
            entry.root.root_id.0
        )));
    }
    Err(RedirError::Unsupported(
        "volume information cannot be changed".to_string(),
    ))
}

fn ensure_writable(entry: &HandleEntry) -> RedirResult<()> {
    if !entry.writable {
        return Err(RedirError::AccessDenied(format!(
            "handle {:#x} was not opened for writing",
            entry.id.0
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn volume_sizes(entry: &HandleEntry) -> RedirResult<(u64, u64, u32)> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(entry.root.base_path.as_os_str().as_bytes())
        .map_err(|_| RedirError::InvalidPath("NUL in host path".to_string()))?;
    let mut out = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: statvfs writes into `out` and the return value is checked
    // before the struct is read.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), out.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: statvfs initialized the struct on success.
    let out = unsafe { out.assume_init() };
    let fragment = out.f_frsize as u64;
    Ok((
        out.f_blocks as u64 * fragment,
        out.f_bavail as u64 * fragment,
        out.f_bsize as u32,
    ))
}

#[cfg(not(unix))]
fn volume_sizes(_entry: &HandleEntry) -> RedirResult<(u64, u64, u32)> {
    Err(RedirError::Unsupported(
        "volume size query is not implemented on this host".to_string(),
    ))
}
