use crate::client::{FileWriter, HubClient};
use crate::{
    CommitInfo, CommitKind, CommitRef, FileInfo, FileKind, FileRef, HubError, HubResult, RepoInfo,
    Shard,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// In-process hub holding repos, commits and file bytes in memory.
///
/// Commits are append-only: a `from_commit` diff base exposes the bytes and
/// entries added after that commit. Used by the filesystem test-suite and
/// for offline smoke runs.
#[derive(Default, Clone)]
pub struct MemHub {
    state: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    repos: BTreeMap<String, MemRepo>,
}

#[derive(Default)]
struct MemRepo {
    created: Option<u64>,
    commits: BTreeMap<String, MemCommit>,
}

struct MemCommit {
    open: bool,
    started: Option<u64>,
    finished: Option<u64>,
    entries: BTreeMap<String, MemEntry>,
}

enum MemEntry {
    Dir,
    File(MemFile),
}

#[derive(Clone)]
struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    modified: Option<u64>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Direct-child test: `path` is exactly one segment below `dir`.
fn is_child_of(path: &str, dir: &str) -> bool {
    let prefix = if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    };
    match path.strip_prefix(prefix.as_str()) {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}

fn is_under(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path == dir || path.starts_with(&format!("{}/", dir))
}

impl MemHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repo(&self, name: &str) {
        let mut state = self.lock();
        state.repos.entry(name.to_string()).or_insert(MemRepo {
            created: Some(unix_now()),
            commits: BTreeMap::new(),
        });
    }

    pub fn add_commit(&self, repo: &str, id: &str, open: bool) {
        let now = unix_now();
        let mut state = self.lock();
        let repo = state.repos.entry(repo.to_string()).or_default();
        repo.commits.entry(id.to_string()).or_insert(MemCommit {
            open,
            started: Some(now),
            finished: if open { None } else { Some(now) },
            entries: BTreeMap::new(),
        });
    }

    pub fn finish_commit(&self, repo: &str, id: &str) {
        let mut state = self.lock();
        if let Some(commit) = state
            .repos
            .get_mut(repo)
            .and_then(|r| r.commits.get_mut(id))
        {
            commit.open = false;
            commit.finished = Some(unix_now());
        }
    }

    /// Seeds file contents directly, ignoring the open/finished state.
    pub fn put_file(&self, repo: &str, commit: &str, path: &str, data: &[u8]) {
        let path = normalize(path);
        let mut state = self.lock();
        if let Some(commit) = state
            .repos
            .get_mut(repo)
            .and_then(|r| r.commits.get_mut(commit))
        {
            commit.entries.insert(
                path,
                MemEntry::File(MemFile {
                    data: Arc::new(Mutex::new(data.to_vec())),
                    modified: Some(unix_now()),
                }),
            );
        }
    }

    pub fn add_directory(&self, repo: &str, commit: &str, path: &str) {
        let path = normalize(path);
        let mut state = self.lock();
        if let Some(commit) = state
            .repos
            .get_mut(repo)
            .and_then(|r| r.commits.get_mut(commit))
        {
            commit.entries.insert(path, MemEntry::Dir);
        }
    }

    pub fn file_contents(&self, repo: &str, commit: &str, path: &str) -> Option<Vec<u8>> {
        let path = normalize(path);
        let state = self.lock();
        match state.repos.get(repo)?.commits.get(commit)?.entries.get(&path)? {
            MemEntry::File(file) => Some(file.data.lock().ok()?.clone()),
            MemEntry::Dir => None,
        }
    }

    pub fn has_file(&self, repo: &str, commit: &str, path: &str) -> bool {
        self.file_contents(repo, commit, path).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_commit<T>(
        &self,
        repo: &str,
        commit: &str,
        f: impl FnOnce(&MemCommit) -> HubResult<T>,
    ) -> HubResult<T> {
        let state = self.lock();
        let repo_entry = state
            .repos
            .get(repo)
            .ok_or_else(|| HubError::NotFound(format!("repo {}", repo)))?;
        let commit_entry = repo_entry
            .commits
            .get(commit)
            .ok_or_else(|| HubError::NotFound(format!("commit {}/{}", repo, commit)))?;
        f(commit_entry)
    }

    /// Bytes already present at the diff base, 0 when the base lacks the file.
    fn base_len(&self, repo: &str, from_commit: Option<&str>, path: &str) -> u64 {
        let Some(from) = from_commit else { return 0 };
        let state = self.lock();
        let Some(entry) = state
            .repos
            .get(repo)
            .and_then(|r| r.commits.get(from))
            .and_then(|c| c.entries.get(path))
        else {
            return 0;
        };
        match entry {
            MemEntry::File(file) => file.data.lock().map(|d| d.len() as u64).unwrap_or(0),
            MemEntry::Dir => 0,
        }
    }

    fn base_has_entry(&self, repo: &str, from_commit: Option<&str>, path: &str) -> bool {
        let Some(from) = from_commit else {
            return false;
        };
        let state = self.lock();
        state
            .repos
            .get(repo)
            .and_then(|r| r.commits.get(from))
            .map(|c| c.entries.contains_key(path))
            .unwrap_or(false)
    }

    fn file_info(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        kind: FileKind,
        size_bytes: u64,
        modified: Option<u64>,
    ) -> FileInfo {
        FileInfo {
            file: FileRef {
                commit: CommitRef::new(repo, commit),
                path: path.to_string(),
            },
            kind,
            size_bytes,
            modified,
        }
    }
}

#[async_trait]
impl HubClient for MemHub {
    async fn list_repos(&self) -> HubResult<Vec<RepoInfo>> {
        let state = self.lock();
        Ok(state
            .repos
            .iter()
            .map(|(name, repo)| {
                let size_bytes = repo
                    .commits
                    .values()
                    .flat_map(|c| c.entries.values())
                    .filter_map(|e| match e {
                        MemEntry::File(f) => f.data.lock().ok().map(|d| d.len() as u64),
                        MemEntry::Dir => None,
                    })
                    .sum();
                RepoInfo {
                    name: name.clone(),
                    created: repo.created,
                    size_bytes,
                }
            })
            .collect())
    }

    async fn inspect_repo(&self, repo: &str) -> HubResult<RepoInfo> {
        let state = self.lock();
        let entry = state
            .repos
            .get(repo)
            .ok_or_else(|| HubError::NotFound(format!("repo {}", repo)))?;
        Ok(RepoInfo {
            name: repo.to_string(),
            created: entry.created,
            size_bytes: 0,
        })
    }

    async fn list_commits(&self, repo: &str) -> HubResult<Vec<CommitInfo>> {
        let state = self.lock();
        let entry = state
            .repos
            .get(repo)
            .ok_or_else(|| HubError::NotFound(format!("repo {}", repo)))?;
        Ok(entry
            .commits
            .iter()
            .map(|(id, commit)| CommitInfo {
                commit: CommitRef::new(repo, id.clone()),
                kind: if commit.open {
                    CommitKind::Write
                } else {
                    CommitKind::Read
                },
                started: commit.started,
                finished: commit.finished,
            })
            .collect())
    }

    async fn inspect_commit(&self, repo: &str, id: &str) -> HubResult<CommitInfo> {
        self.with_commit(repo, id, |commit| {
            Ok(CommitInfo {
                commit: CommitRef::new(repo, id),
                kind: if commit.open {
                    CommitKind::Write
                } else {
                    CommitKind::Read
                },
                started: commit.started,
                finished: commit.finished,
            })
        })
    }

    async fn list_files(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from_commit: Option<&str>,
        shard: Option<&Shard>,
        recurse: bool,
    ) -> HubResult<Vec<FileInfo>> {
        let dir = normalize(path);
        let candidates: Vec<(String, FileKind, u64, Option<u64>)> =
            self.with_commit(repo, commit, |entry| {
                Ok(entry
                    .entries
                    .iter()
                    .filter(|(p, _)| {
                        if recurse {
                            is_under(p, &dir) && p.as_str() != dir
                        } else {
                            is_child_of(p, &dir)
                        }
                    })
                    .map(|(p, e)| match e {
                        MemEntry::Dir => (p.clone(), FileKind::Dir, 0, None),
                        MemEntry::File(f) => (
                            p.clone(),
                            FileKind::Regular,
                            f.data.lock().map(|d| d.len() as u64).unwrap_or(0),
                            f.modified,
                        ),
                    })
                    .collect())
            })?;

        let mut out = Vec::new();
        for (p, kind, len, modified) in candidates {
            match kind {
                FileKind::Dir => {
                    out.push(self.file_info(repo, commit, &p, kind, 0, modified));
                }
                _ => {
                    if let Some(shard) = shard {
                        if !shard.selects(&p) {
                            continue;
                        }
                    }
                    let base = self.base_len(repo, from_commit, &p);
                    let delta = len.saturating_sub(base);
                    if from_commit.is_some()
                        && delta == 0
                        && self.base_has_entry(repo, from_commit, &p)
                    {
                        continue;
                    }
                    let size = if from_commit.is_some() { delta } else { len };
                    out.push(self.file_info(repo, commit, &p, kind, size, modified));
                }
            }
        }
        Ok(out)
    }

    async fn inspect_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from_commit: Option<&str>,
        shard: Option<&Shard>,
    ) -> HubResult<FileInfo> {
        let path = normalize(path);
        let (kind, len, modified) = self.with_commit(repo, commit, |entry| {
            match entry.entries.get(&path) {
                Some(MemEntry::Dir) => Ok((FileKind::Dir, 0, None)),
                Some(MemEntry::File(f)) => Ok((
                    FileKind::Regular,
                    f.data.lock().map(|d| d.len() as u64).unwrap_or(0),
                    f.modified,
                )),
                None => {
                    // A path with children but no explicit entry is a directory.
                    if entry.entries.keys().any(|p| is_under(p, &path)) {
                        Ok((FileKind::Dir, 0, None))
                    } else {
                        Err(HubError::NotFound(format!(
                            "file {}/{}{}",
                            repo, commit, path
                        )))
                    }
                }
            }
        })?;

        if kind == FileKind::Regular {
            if let Some(shard) = shard {
                if !shard.selects(&path) {
                    return Err(HubError::NotFound(format!(
                        "file {}/{}{} outside shard",
                        repo, commit, path
                    )));
                }
            }
            let base = self.base_len(repo, from_commit, &path);
            let delta = len.saturating_sub(base);
            if from_commit.is_some() && delta == 0 && self.base_has_entry(repo, from_commit, &path)
            {
                return Err(HubError::NotFound(format!(
                    "file {}/{}{} unchanged since {}",
                    repo,
                    commit,
                    path,
                    from_commit.unwrap_or("")
                )));
            }
            let size = if from_commit.is_some() { delta } else { len };
            return Ok(self.file_info(repo, commit, &path, kind, size, modified));
        }
        Ok(self.file_info(repo, commit, &path, kind, 0, modified))
    }

    async fn get_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        offset: u64,
        size: u64,
        from_commit: Option<&str>,
        shard: Option<&Shard>,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> HubResult<u64> {
        let path = normalize(path);
        if let Some(shard) = shard {
            if !shard.selects(&path) {
                return Err(HubError::NotFound(format!(
                    "file {}/{}{} outside shard",
                    repo, commit, path
                )));
            }
        }
        let data = self.with_commit(repo, commit, |entry| match entry.entries.get(&path) {
            Some(MemEntry::File(f)) => Ok(f.data.clone()),
            Some(MemEntry::Dir) => Err(HubError::InvalidParam(format!("{} is a directory", path))),
            None => Err(HubError::NotFound(format!(
                "file {}/{}{}",
                repo, commit, path
            ))),
        })?;
        let base = self.base_len(repo, from_commit, &path) as usize;
        let bytes = {
            let data = data
                .lock()
                .map_err(|_| HubError::Internal("file lock poisoned".to_string()))?;
            let delta = data.get(base..).unwrap_or(&[]);
            let start = (offset as usize).min(delta.len());
            let end = start.saturating_add(size as usize).min(delta.len());
            delta[start..end].to_vec()
        };
        sink.write_all(&bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn put_file_writer(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        _handle_id: &str,
    ) -> HubResult<Box<dyn FileWriter>> {
        let path = normalize(path);
        let mut state = self.lock();
        let commit_entry = state
            .repos
            .get_mut(repo)
            .and_then(|r| r.commits.get_mut(commit))
            .ok_or_else(|| HubError::NotFound(format!("commit {}/{}", repo, commit)))?;
        if !commit_entry.open {
            return Err(HubError::PermissionDenied(format!(
                "commit {}/{} is finished",
                repo, commit
            )));
        }
        let data = match commit_entry.entries.get(&path) {
            Some(MemEntry::File(f)) => f.data.clone(),
            Some(MemEntry::Dir) => {
                return Err(HubError::InvalidParam(format!("{} is a directory", path)))
            }
            None => {
                let data = Arc::new(Mutex::new(Vec::new()));
                commit_entry.entries.insert(
                    path,
                    MemEntry::File(MemFile {
                        data: data.clone(),
                        modified: Some(unix_now()),
                    }),
                );
                data
            }
        };
        Ok(Box::new(MemFileWriter { data }))
    }

    async fn make_directory(&self, repo: &str, commit: &str, path: &str) -> HubResult<()> {
        let path = normalize(path);
        let mut state = self.lock();
        let commit_entry = state
            .repos
            .get_mut(repo)
            .and_then(|r| r.commits.get_mut(commit))
            .ok_or_else(|| HubError::NotFound(format!("commit {}/{}", repo, commit)))?;
        if !commit_entry.open {
            return Err(HubError::PermissionDenied(format!(
                "commit {}/{} is finished",
                repo, commit
            )));
        }
        if matches!(commit_entry.entries.get(&path), Some(MemEntry::File(_))) {
            return Err(HubError::AlreadyExists(format!("{} is a file", path)));
        }
        commit_entry.entries.insert(path, MemEntry::Dir);
        Ok(())
    }

    async fn delete_file(&self, repo: &str, commit: &str, path: &str) -> HubResult<()> {
        let path = normalize(path);
        let mut state = self.lock();
        let commit_entry = state
            .repos
            .get_mut(repo)
            .and_then(|r| r.commits.get_mut(commit))
            .ok_or_else(|| HubError::NotFound(format!("commit {}/{}", repo, commit)))?;
        if !commit_entry.open {
            return Err(HubError::PermissionDenied(format!(
                "commit {}/{} is finished",
                repo, commit
            )));
        }
        // Removing an absent path succeeds: the caller may be clearing a
        // name that only ever existed locally.
        let doomed: Vec<String> = commit_entry
            .entries
            .keys()
            .filter(|p| is_under(p, &path))
            .cloned()
            .collect();
        for p in doomed {
            commit_entry.entries.remove(&p);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemFileWriter {
    data: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl FileWriter for MemFileWriter {
    async fn write(&mut self, data: &[u8]) -> HubResult<usize> {
        let mut bytes = self
            .data
            .lock()
            .map_err(|_| HubError::Internal("file lock poisoned".to_string()))?;
        bytes.extend_from_slice(data);
        Ok(data.len())
    }

    async fn close(&mut self) -> HubResult<()> {
        Ok(())
    }
}
