use std::collections::BTreeMap;
use std::path::PathBuf;

use log::debug;
use redir_lib::{DirEntry, ObjectInfo, RedirResult};

/// Resumable listing cursor bound to a directory handle.
///
/// The first page snapshots the directory into a name-sorted list; later
/// pages walk the snapshot. Host-side mutations during an in-progress
/// enumeration may be observed or missed; only monotonic forward progress
/// and completeness under a static directory are guaranteed.
pub struct DirCursor {
    dir_path: PathBuf,
    state: CursorState,
}

enum CursorState {
    Fresh,
    Enumerating {
        entries: Vec<DirEntry>,
        position: usize,
    },
    Exhausted,
}

impl DirCursor {
    pub fn new(dir_path: PathBuf) -> Self {
        Self {
            dir_path,
            state: CursorState::Fresh,
        }
    }

    /// Return up to `max_entries` entries (0 = no limit) plus a flag telling
    /// whether more remain. An exhausted cursor yields `(vec![], false)`,
    /// never an error. The optional filter is a guest wildcard pattern
    /// (`*`/`?`) applied when the snapshot is taken.
    pub async fn next_page(
        &mut self,
        max_entries: usize,
        filter: Option<&str>,
        fold_case: bool,
    ) -> RedirResult<(Vec<DirEntry>, bool)> {
        if let CursorState::Fresh = self.state {
            let entries = self.snapshot(filter, fold_case).await?;
            debug!(
                "dir cursor for {} snapshotted {} entries",
                self.dir_path.display(),
                entries.len()
            );
            self.state = CursorState::Enumerating {
                entries,
                position: 0,
            };
        }

        match &mut self.state {
            CursorState::Fresh => unreachable!(),
            CursorState::Exhausted => Ok((Vec::new(), false)),
            CursorState::Enumerating { entries, position } => {
                let remaining = entries.len() - *position;
                let take = if max_entries == 0 {
                    remaining
                } else {
                    remaining.min(max_entries)
                };
                let page = entries[*position..*position + take].to_vec();
                *position += take;
                let more = *position < entries.len();
                if !more {
                    self.state = CursorState::Exhausted;
                }
                Ok((page, more))
            }
        }
    }

    /// Reset to the fresh state so the next page re-reads the directory.
    pub fn rewind(&mut self) {
        self.state = CursorState::Fresh;
    }

    async fn snapshot(
        &self,
        filter: Option<&str>,
        fold_case: bool,
    ) -> RedirResult<Vec<DirEntry>> {
        let mut read_dir = tokio::fs::read_dir(&self.dir_path).await?;
        let mut sorted: BTreeMap<String, DirEntry> = BTreeMap::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(pattern) = filter {
                if !wildcard_match(pattern, &name, fold_case) {
                    continue;
                }
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Entry vanished between readdir and stat: skip it.
                Err(_) => continue,
            };
            sorted.insert(
                name.clone(),
                DirEntry {
                    name,
                    info: ObjectInfo::from_metadata(&meta),
                },
            );
        }
        Ok(sorted.into_values().collect())
    }
}

/// Guest wildcard match: `*` spans any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, name: &str, fold_case: bool) -> bool {
    let (pattern, name) = if fold_case {
        (pattern.to_lowercase(), name.to_lowercase())
    } else {
        (pattern.to_string(), name.to_string())
    };
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = name.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
