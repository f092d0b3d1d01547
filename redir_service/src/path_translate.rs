use std::path::{Path, PathBuf};

use redir_lib::{GuestPath, RedirError, RedirResult};

use crate::root_table::RootEntry;

/// Longest host path accepted after translation. Longer results are rejected
/// with InvalidPath, never truncated.
pub const MAX_HOST_PATH_BYTES: usize = 4096;

/// Translate a validated guest path into a host path confined to the root's
/// base directory. This is the security boundary of the whole subsystem: the
/// returned path is the only form ever handed to host filesystem calls.
pub async fn translate(root: &RootEntry, path: &GuestPath) -> RedirResult<PathBuf> {
    let components = validate_components(path)?;

    let host_path = if root.case_sensitive {
        let mut joined = root.base_path.clone();
        for comp in &components {
            joined.push(comp);
        }
        joined
    } else {
        resolve_case_folded(&root.base_path, &components).await?
    };

    if host_path.as_os_str().len() > MAX_HOST_PATH_BYTES {
        return Err(RedirError::InvalidPath(format!(
            "translated path exceeds {} bytes",
            MAX_HOST_PATH_BYTES
        )));
    }
    Ok(host_path)
}

/// Lexical validation: no `..` anywhere, no drive-letter absolute form.
/// Leading separators were already normalized away by GuestPath, so the
/// surviving components are all root-relative.
fn validate_components(path: &GuestPath) -> RedirResult<Vec<&str>> {
    let mut out = Vec::new();
    for comp in path.components() {
        if comp == ".." {
            return Err(RedirError::InvalidPath(format!(
                "path '{}' escapes its root",
                path
            )));
        }
        if out.is_empty() && is_drive_prefix(comp) {
            return Err(RedirError::InvalidPath(format!(
                "path '{}' is absolute",
                path
            )));
        }
        out.push(comp);
    }
    Ok(out)
}

fn is_drive_prefix(comp: &str) -> bool {
    let bytes = comp.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Walk the components against existing directory entries, correcting case
/// where the exact name is absent. Once a component cannot be found by any
/// casing the rest is appended as supplied, so create-style operations still
/// translate; the eventual host call decides whether the path works.
async fn resolve_case_folded(base: &Path, components: &[&str]) -> RedirResult<PathBuf> {
    let mut current = base.to_path_buf();
    for (idx, comp) in components.iter().enumerate() {
        let exact = current.join(comp);
        if tokio::fs::symlink_metadata(&exact).await.is_ok() {
            current = exact;
            continue;
        }
        match find_case_match(&current, comp).await? {
            Some(actual) => current.push(actual),
            None => {
                for rest in &components[idx..] {
                    current.push(rest);
                }
                break;
            }
        }
    }
    Ok(current)
}

async fn find_case_match(dir: &Path, name: &str) -> RedirResult<Option<String>> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(v) => v,
        // Parent missing or unreadable: nothing to correct against.
        Err(_) => return Ok(None),
    };
    let want = name.to_lowercase();
    while let Some(entry) = read_dir.next_entry().await.map_err(RedirError::from)? {
        let candidate = entry.file_name();
        let candidate = match candidate.to_str() {
            Some(v) => v,
            None => continue,
        };
        if candidate.to_lowercase() == want {
            return Ok(Some(candidate.to_string()));
        }
    }
    Ok(None)
}
