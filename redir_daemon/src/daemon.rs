use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use redir_lib::{
    ClientId, CreateParams, FileInfoPatch, GuestPath, HandleId, RedirError, RedirResult, RootId,
    TransferOutcome,
};
use redir_service::{Redirector, RedirectorService, RootConfig, RootTable};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::runtime::Runtime;

pub const DEFAULT_SHARES_CONFIG_PATH: &str = "/etc/redir/shares.json";

#[derive(Debug, Clone)]
pub struct RedirDaemonRunOptions {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SharesConfigFile {
    #[serde(alias = "shares", alias = "mappings")]
    folders: Vec<SharedFolderEntry>,
}

impl Default for SharesConfigFile {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SharedFolderEntry {
    name: Option<String>,
    #[serde(alias = "base_dir", alias = "host_path")]
    path: PathBuf,
    /// Defaults to the host convention when absent.
    case_sensitive: Option<bool>,
    readonly: bool,
    enabled: bool,
}

impl Default for SharedFolderEntry {
    fn default() -> Self {
        Self {
            name: None,
            path: PathBuf::new(),
            case_sensitive: None,
            readonly: false,
            enabled: true,
        }
    }
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> RedirResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| RedirError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| RedirError::IoError(format!("parse {} failed: {}", path.display(), e)))
}

fn resolve_share_name(entry: &SharedFolderEntry, index: usize) -> String {
    if let Some(name) = entry.name.as_ref().filter(|v| !v.is_empty()) {
        return name.clone();
    }
    entry
        .path
        .file_name()
        .and_then(|v| v.to_str())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| format!("share-{}", index + 1))
}

fn host_case_sensitive_default() -> bool {
    cfg!(not(any(target_os = "windows", target_os = "macos")))
}

/// Request envelope carried over the co-located transport: one JSON object
/// per line, tagged by operation. The real transport stays out of scope; this
/// surface exists so the service can be driven and tested end to end.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    client: String,
    #[serde(flatten)]
    op: RequestOp,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RequestOp {
    Connect,
    Disconnect,
    ListRoots,
    Create {
        root: u32,
        path: String,
        params: CreateParams,
    },
    Close {
        handle: u64,
    },
    Read {
        handle: u64,
        offset: u64,
        length: u32,
    },
    Write {
        handle: u64,
        offset: u64,
        data: Vec<u8>,
    },
    ReadPages {
        handle: u64,
        offset: u64,
        length: u64,
        page_size: u32,
        page_count: u32,
    },
    WritePages {
        handle: u64,
        offset: u64,
        length: u64,
        pages: Vec<Vec<u8>>,
    },
    CopyFilePart {
        src_handle: u64,
        src_offset: u64,
        dst_handle: u64,
        dst_offset: u64,
        length: u64,
    },
    Lock {
        handle: u64,
        offset: u64,
        length: u64,
        exclusive: bool,
    },
    Unlock {
        handle: u64,
        offset: u64,
        length: u64,
    },
    ListDir {
        handle: u64,
        max_entries: u32,
        filter: Option<String>,
    },
    RewindDir {
        handle: u64,
    },
    Flush {
        handle: u64,
    },
    SetFileSize {
        handle: u64,
        size: u64,
    },
    QueryFileInfo {
        handle: u64,
    },
    SetFileInfo {
        handle: u64,
        patch: FileInfoPatch,
    },
    QueryFsInfo {
        handle: u64,
    },
    SetFsInfo {
        handle: u64,
    },
    Remove {
        root: u32,
        path: String,
        directory: bool,
        close_handle: Option<u64>,
    },
    Rename {
        root: u32,
        src: String,
        dst: String,
        replace: bool,
    },
    CopyFile {
        src_root: u32,
        src_path: String,
        dst_root: u32,
        dst_path: String,
    },
    ReadLink {
        root: u32,
        path: String,
    },
    Symlink {
        root: u32,
        path: String,
        target: String,
    },
    QueryPathInfo {
        root: u32,
        path: String,
    },
}

pub struct RedirDaemon {
    service: Arc<RedirectorService>,
}

impl RedirDaemon {
    /// Build a daemon from a shares config file, registering every enabled
    /// folder as a root.
    pub async fn from_config_file(config_path: &Path) -> RedirResult<Self> {
        let config: SharesConfigFile = read_json_config(config_path)?;
        let service = RedirectorService::new(Arc::new(RootTable::new()));

        let mut shared = 0usize;
        for (index, entry) in config.folders.iter().enumerate() {
            if !entry.enabled {
                continue;
            }
            if entry.path.as_os_str().is_empty() {
                return Err(RedirError::InvalidPath(format!(
                    "share config {} has empty path at index {}",
                    config_path.display(),
                    index
                )));
            }
            let name = resolve_share_name(entry, index);
            let root_id = service
                .roots()
                .share(RootConfig {
                    name: name.clone(),
                    base_path: entry.path.clone(),
                    case_sensitive: entry
                        .case_sensitive
                        .unwrap_or_else(host_case_sensitive_default),
                    read_only: entry.readonly,
                })
                .await?;
            info!("shared folder '{}' as root {}", name, root_id.0);
            shared += 1;
        }
        if shared == 0 {
            return Err(RedirError::NoSuchRoot(format!(
                "share config {} contains no enabled folders",
                config_path.display()
            )));
        }
        Ok(Self {
            service: Arc::new(service),
        })
    }

    /// Dispatch one envelope line and produce the reply line.
    pub async fn handle_request(&self, line: &str) -> String {
        let envelope: RequestEnvelope = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return json!({ "status": "bad_request", "message": e.to_string() }).to_string()
            }
        };
        let client = ClientId(envelope.client);
        match self.dispatch(&client, envelope.op).await {
            Ok(OpReply::Done(result)) => {
                json!({ "status": "ok", "result": result }).to_string()
            }
            Ok(OpReply::Partial { error, result }) => json!({
                "status": error.status_name(),
                "message": error.to_string(),
                "result": result,
            })
            .to_string(),
            Err(err) => {
                json!({ "status": err.status_name(), "message": err.to_string() }).to_string()
            }
        }
    }

    async fn dispatch(&self, client: &ClientId, op: RequestOp) -> RedirResult<OpReply> {
        let svc = self.service.as_ref();
        match op {
            RequestOp::Connect => {
                svc.client_connected(client).await?;
                done(Value::Null)
            }
            RequestOp::Disconnect => {
                svc.client_disconnected(client).await?;
                done(Value::Null)
            }
            RequestOp::ListRoots => {
                let mappings = svc.list_roots(client).await?;
                done(serde_json::to_value(mappings).unwrap_or(Value::Null))
            }
            RequestOp::Create { root, path, params } => {
                let (handle, info) = svc
                    .create(client, RootId(root), &encode_path(&path)?, &params)
                    .await?;
                done(json!({ "handle": handle.0, "info": info }))
            }
            RequestOp::Close { handle } => {
                svc.close(client, HandleId(handle)).await?;
                done(Value::Null)
            }
            RequestOp::Read {
                handle,
                offset,
                length,
            } => {
                let data = svc.read(client, HandleId(handle), offset, length).await?;
                done(json!({ "data": data }))
            }
            RequestOp::Write {
                handle,
                offset,
                data,
            } => {
                let written = svc.write(client, HandleId(handle), offset, &data).await?;
                done(json!({ "written": written }))
            }
            RequestOp::ReadPages {
                handle,
                offset,
                length,
                page_size,
                page_count,
            } => {
                let mut pages = vec![vec![0u8; page_size as usize]; page_count as usize];
                let outcome = svc
                    .read_pages(client, HandleId(handle), offset, length, &mut pages)
                    .await;
                transfer_value(outcome, Some(pages))
            }
            RequestOp::WritePages {
                handle,
                offset,
                length,
                pages,
            } => {
                let outcome = svc
                    .write_pages(client, HandleId(handle), offset, length, &pages)
                    .await;
                transfer_value(outcome, None)
            }
            RequestOp::CopyFilePart {
                src_handle,
                src_offset,
                dst_handle,
                dst_offset,
                length,
            } => {
                let outcome = svc
                    .copy_file_part(
                        client,
                        HandleId(src_handle),
                        src_offset,
                        HandleId(dst_handle),
                        dst_offset,
                        length,
                    )
                    .await;
                transfer_value(outcome, None)
            }
            RequestOp::Lock {
                handle,
                offset,
                length,
                exclusive,
            } => {
                svc.lock(client, HandleId(handle), offset, length, exclusive)
                    .await?;
                done(Value::Null)
            }
            RequestOp::Unlock {
                handle,
                offset,
                length,
            } => {
                svc.unlock(client, HandleId(handle), offset, length).await?;
                done(Value::Null)
            }
            RequestOp::ListDir {
                handle,
                max_entries,
                filter,
            } => {
                let (entries, more) = svc
                    .list_dir(client, HandleId(handle), max_entries, filter.as_deref())
                    .await?;
                done(json!({ "entries": entries, "more": more }))
            }
            RequestOp::RewindDir { handle } => {
                svc.rewind_dir(client, HandleId(handle)).await?;
                done(Value::Null)
            }
            RequestOp::Flush { handle } => {
                svc.flush(client, HandleId(handle)).await?;
                done(Value::Null)
            }
            RequestOp::SetFileSize { handle, size } => {
                svc.set_file_size(client, HandleId(handle), size).await?;
                done(Value::Null)
            }
            RequestOp::QueryFileInfo { handle } => {
                let info = svc.query_file_info(client, HandleId(handle)).await?;
                done(serde_json::to_value(info).unwrap_or(Value::Null))
            }
            RequestOp::SetFileInfo { handle, patch } => {
                let info = svc.set_file_info(client, HandleId(handle), &patch).await?;
                done(serde_json::to_value(info).unwrap_or(Value::Null))
            }
            RequestOp::QueryFsInfo { handle } => {
                let props = svc.query_fs_info(client, HandleId(handle)).await?;
                done(serde_json::to_value(props).unwrap_or(Value::Null))
            }
            RequestOp::SetFsInfo { handle } => {
                svc.set_fs_info(client, HandleId(handle)).await?;
                done(Value::Null)
            }
            RequestOp::Remove {
                root,
                path,
                directory,
                close_handle,
            } => {
                svc.remove(
                    client,
                    RootId(root),
                    &encode_path(&path)?,
                    directory,
                    close_handle.map(HandleId),
                )
                .await?;
                done(Value::Null)
            }
            RequestOp::Rename {
                root,
                src,
                dst,
                replace,
            } => {
                svc.rename(
                    client,
                    RootId(root),
                    &encode_path(&src)?,
                    &encode_path(&dst)?,
                    replace,
                )
                .await?;
                done(Value::Null)
            }
            RequestOp::CopyFile {
                src_root,
                src_path,
                dst_root,
                dst_path,
            } => {
                let bytes = svc
                    .copy_file(
                        client,
                        RootId(src_root),
                        &encode_path(&src_path)?,
                        RootId(dst_root),
                        &encode_path(&dst_path)?,
                    )
                    .await?;
                done(json!({ "copied": bytes }))
            }
            RequestOp::ReadLink { root, path } => {
                let target = svc
                    .read_link(client, RootId(root), &encode_path(&path)?)
                    .await?;
                done(json!({ "target": target }))
            }
            RequestOp::Symlink { root, path, target } => {
                let info = svc
                    .symlink(
                        client,
                        RootId(root),
                        &encode_path(&path)?,
                        &encode_path(&target)?,
                    )
                    .await?;
                done(serde_json::to_value(info).unwrap_or(Value::Null))
            }
            RequestOp::QueryPathInfo { root, path } => {
                let info = svc
                    .query_path_info(client, RootId(root), &encode_path(&path)?)
                    .await?;
                done(serde_json::to_value(info).unwrap_or(Value::Null))
            }
        }
    }

    /// Newline-delimited JSON loop until the reader ends.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> RedirResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| RedirError::IoError(format!("transport read failed: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let mut reply = self.handle_request(&line).await;
            reply.push('\n');
            writer
                .write_all(reply.as_bytes())
                .await
                .map_err(|e| RedirError::IoError(format!("transport write failed: {}", e)))?;
            writer
                .flush()
                .await
                .map_err(|e| RedirError::IoError(format!("transport flush failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Reply of one dispatched operation. Bulk transfers that fail partway keep
/// their progress count next to the failing status instead of losing it.
enum OpReply {
    Done(Value),
    Partial { error: RedirError, result: Value },
}

fn done(value: Value) -> RedirResult<OpReply> {
    Ok(OpReply::Done(value))
}

fn encode_path(path: &str) -> RedirResult<Vec<u8>> {
    Ok(GuestPath::new(path)?.to_wire())
}

fn transfer_value(outcome: TransferOutcome, pages: Option<Vec<Vec<u8>>>) -> RedirResult<OpReply> {
    let mut result = json!({ "transferred": outcome.transferred });
    if let Some(pages) = pages {
        result["pages"] = serde_json::to_value(pages).unwrap_or(Value::Null);
    }
    match outcome.error {
        Some(error) => {
            warn!(
                "transfer stopped after {} bytes: {}",
                outcome.transferred, error
            );
            Ok(OpReply::Partial { error, result })
        }
        None => Ok(OpReply::Done(result)),
    }
}

pub fn run_daemon(options: RedirDaemonRunOptions) -> RedirResult<()> {
    let runtime =
        Runtime::new().map_err(|e| RedirError::IoError(format!("create runtime failed: {}", e)))?;
    runtime.block_on(async {
        let daemon = RedirDaemon::from_config_file(&options.config_path).await?;
        info!("redirector daemon ready");
        daemon.serve(tokio::io::stdin(), tokio::io::stdout()).await
    })
}
