use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use hub_lib::{
    CommitRef, FileKind, FileWriter, HttpHubClient, HubClient, HubError, HubResult, Shard,
};
use libc::{EBADF, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, EPERM};
use log::{debug, info, warn};
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;

/// Attributes change while writes stream into an open commit, so the kernel
/// must revalidate on every access.
const TTL: Duration = Duration::from_nanos(1);

pub(crate) const ROOT_INODE: u64 = 1;

pub const DEFAULT_HUB_URL: &str = "http://127.0.0.1:8630";

// ------------------------------
// Mount configuration
// ------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MountConfigFile {
    pub shard: Option<Shard>,
    #[serde(alias = "mounts")]
    pub commit_mounts: Vec<CommitMountConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CommitMountConfig {
    pub repo: String,
    /// Commit id; empty means the mount is not pinned and lists commits.
    #[serde(alias = "id")]
    pub commit: String,
    /// Diff base: reads report only what changed since this commit.
    #[serde(alias = "from")]
    pub from_commit: Option<String>,
    pub alias: Option<String>,
    pub shard: Option<Shard>,
}

impl MountConfigFile {
    pub fn into_config(self) -> HubResult<MountConfig> {
        let mut mounts = Vec::with_capacity(self.commit_mounts.len());
        let mut seen_aliases = Vec::new();
        for entry in self.commit_mounts {
            if entry.repo.is_empty() {
                return Err(HubError::InvalidParam(
                    "commit mount with empty repo".to_string(),
                ));
            }
            let alias = entry.alias.filter(|a| !a.is_empty());
            if let Some(alias) = &alias {
                if seen_aliases.contains(alias) {
                    return Err(HubError::InvalidParam(format!(
                        "duplicate mount alias '{}'",
                        alias
                    )));
                }
                seen_aliases.push(alias.clone());
            }
            let from_commit = entry
                .from_commit
                .filter(|id| !id.is_empty())
                .map(|id| CommitRef::new(entry.repo.clone(), id));
            mounts.push(CommitMount {
                commit: CommitRef::new(entry.repo, entry.commit),
                from_commit,
                alias,
                shard: entry.shard.or(self.shard),
            });
        }
        Ok(MountConfig {
            shard: self.shard,
            commit_mounts: mounts,
        })
    }
}

/// Immutable for the lifetime of the mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub(crate) shard: Option<Shard>,
    pub(crate) commit_mounts: Vec<CommitMount>,
}

#[derive(Debug, Clone)]
pub struct CommitMount {
    pub(crate) commit: CommitRef,
    pub(crate) from_commit: Option<CommitRef>,
    pub(crate) alias: Option<String>,
    pub(crate) shard: Option<Shard>,
}

impl MountConfig {
    pub fn new(shard: Option<Shard>, commit_mounts: Vec<CommitMount>) -> Self {
        Self {
            shard,
            commit_mounts,
        }
    }

    pub fn empty() -> Self {
        Self::new(None, Vec::new())
    }

    pub(crate) fn resolve(&self, name_or_alias: &str) -> Option<CommitMount> {
        if self.commit_mounts.is_empty() {
            // No mounts configured: the whole hub is browsable, any name
            // resolves to an ad-hoc unpinned mount.
            return Some(CommitMount {
                commit: CommitRef::new(name_or_alias, ""),
                from_commit: None,
                alias: None,
                shard: self.shard,
            });
        }
        // Alias matches take precedence over repo names: two mounts may
        // share a repo and differ only by alias (e.g. "out" vs "prev").
        for mount in &self.commit_mounts {
            if mount.alias.as_deref() == Some(name_or_alias) {
                return Some(mount.clone());
            }
        }
        for mount in &self.commit_mounts {
            if mount.commit.repo == name_or_alias {
                return Some(mount.clone());
            }
        }
        None
    }

    fn from_commit_id(&self, name_or_alias: &str) -> Option<String> {
        self.resolve(name_or_alias)
            .and_then(|mount| mount.from_commit.map(|commit| commit.id))
    }
}

impl CommitMount {
    pub fn new(commit: CommitRef) -> Self {
        Self {
            commit,
            from_commit: None,
            alias: None,
            shard: None,
        }
    }

    pub fn with_from_commit(mut self, from_commit: CommitRef) -> Self {
        self.from_commit = Some(from_commit);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_shard(mut self, shard: Shard) -> Self {
        self.shard = Some(shard);
        self
    }
}

// ------------------------------
// Node model
// ------------------------------

/// One level of the projected tree. Every variant carries enough identity
/// to rebuild its `(repo, commit, path)` key.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Root,
    RepoDir(RepoNode),
    Dir(DirNode),
    File(FileNode),
}

/// A repo directory whose mount does not pin a commit; children are commits.
#[derive(Debug, Clone)]
pub(crate) struct RepoNode {
    pub(crate) repo: String,
    pub(crate) alias: Option<String>,
    pub(crate) shard: Option<Shard>,
}

/// A directory inside a fixed commit; `path == "/"` is the commit root.
#[derive(Debug, Clone)]
pub(crate) struct DirNode {
    pub(crate) repo: String,
    pub(crate) commit: String,
    pub(crate) alias: Option<String>,
    pub(crate) shard: Option<Shard>,
    pub(crate) writable: bool,
    pub(crate) modified: Option<SystemTime>,
    pub(crate) path: String,
}

#[derive(Debug, Clone)]
pub(crate) struct FileNode {
    pub(crate) repo: String,
    pub(crate) commit: String,
    pub(crate) alias: Option<String>,
    pub(crate) shard: Option<Shard>,
    pub(crate) path: String,
    pub(crate) size: u64,
    /// Created by this process; the hub may not know the path yet.
    pub(crate) local: bool,
    pub(crate) writable: bool,
    pub(crate) modified: Option<SystemTime>,
}

impl RepoNode {
    fn repo_or_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.repo)
    }
}

impl DirNode {
    fn repo_or_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.repo)
    }
}

impl FileNode {
    fn repo_or_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.repo)
    }
}

fn node_key(repo: &str, commit: &str, path: &str) -> String {
    format!("{}/{}/{}", repo, commit, path)
}

fn key_of(node: &Node) -> String {
    match node {
        Node::Root => node_key("", "", ""),
        Node::RepoDir(r) => node_key(&r.repo, "", ""),
        Node::Dir(d) => node_key(&d.repo, &d.commit, &d.path),
        Node::File(f) => node_key(&f.repo, &f.commit, &f.path),
    }
}

fn node_ident(node: &Node) -> String {
    match node {
        Node::Root => "/".to_string(),
        Node::RepoDir(r) => r.repo.clone(),
        Node::Dir(d) => format!("{}@{}:{}", d.repo, d.commit, d.path),
        Node::File(f) => format!("{}@{}:{}", f.repo, f.commit, f.path),
    }
}

fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn system_time(secs: Option<u64>) -> Option<SystemTime> {
    secs.map(|s| UNIX_EPOCH + Duration::from_secs(s))
}

// ------------------------------
// Inode table
// ------------------------------

/// Inode assignment is a pure function of the `(repo, commit, path)` triple;
/// entries live for the whole mount. A second map remembers the last
/// resolved node per inode so inode-addressed operations can recover the
/// node identity.
struct InodeTable {
    inodes: RwLock<HashMap<String, u64>>,
    nodes: RwLock<HashMap<u64, Node>>,
}

impl InodeTable {
    fn new() -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(node_key("", "", ""), ROOT_INODE);
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INODE, Node::Root);
        Self {
            inodes: RwLock::new(inodes),
            nodes: RwLock::new(nodes),
        }
    }

    fn get_or_allocate(&self, key: &str) -> u64 {
        if let Ok(map) = self.inodes.read() {
            if let Some(ino) = map.get(key) {
                return *ino;
            }
        }
        let mut map = match self.inodes.write() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the write lock.
        if let Some(ino) = map.get(key) {
            return *ino;
        }
        let ino = map.len() as u64 + 1;
        map.insert(key.to_string(), ino);
        ino
    }

    fn remember(&self, ino: u64, node: &Node) {
        let mut map = match self.nodes.write() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(ino, node.clone());
    }

    fn node(&self, ino: u64) -> Option<Node> {
        self.nodes.read().ok()?.get(&ino).cloned()
    }
}

// ------------------------------
// Open handles
// ------------------------------

struct FileHandle {
    file: FileNode,
    writer: Option<Box<dyn FileWriter>>,
    /// Total bytes this handle has forwarded to the hub.
    written: u64,
}

struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, FileHandle>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(fh, handle);
        }
        fh
    }

    /// Takes the handle out of the table for the duration of `f` so the
    /// table lock is never held across an RPC. The kernel never runs two
    /// operations on one handle concurrently.
    fn with_handle_mut<F, T>(&self, fh: u64, f: F) -> Result<T, i32>
    where
        F: FnOnce(&mut FileHandle) -> Result<T, i32>,
    {
        let mut handle = {
            let mut map = self.handles.lock().map_err(|_| EIO)?;
            map.remove(&fh).ok_or(EBADF)?
        };
        let result = f(&mut handle);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(fh, handle);
        }
        result
    }

    fn remove(&self, fh: u64) -> Option<FileHandle> {
        self.handles.lock().ok()?.remove(&fh)
    }
}

// ------------------------------
// The filesystem adapter
// ------------------------------

pub struct FsMount {
    runtime: Runtime,
    client: Arc<dyn HubClient>,
    config: MountConfig,
    inodes: InodeTable,
    handles: HandleTable,
    /// Per-mount id for put-file streams; the hub reassembles one
    /// sequential byte stream per `(path, stream_id)` pair.
    stream_id: String,
}

fn new_stream_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl FsMount {
    pub fn new(runtime: Runtime, client: Arc<dyn HubClient>, config: MountConfig) -> Self {
        Self {
            runtime,
            client,
            config,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            stream_id: new_stream_id(),
        }
    }

    fn node_desc(&self, ino: u64) -> String {
        match self.inodes.node(ino) {
            Some(node) => node_ident(&node),
            None => format!("#{}", ino),
        }
    }

    // --- lookup -----------------------------------------------------------

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let parent_node = self.inodes.node(parent).ok_or(ENOENT)?;
        let node = match &parent_node {
            Node::Root => self.lookup_repo(name)?,
            Node::RepoDir(repo) => self.lookup_commit(repo, name)?,
            Node::Dir(dir) => self.lookup_child(dir, name)?,
            Node::File(_) => return Err(ENOTDIR),
        };
        let ino = self.inodes.get_or_allocate(&key_of(&node));
        self.inodes.remember(ino, &node);
        let attr = self.node_attr(ino, &node);
        Ok((ino, attr))
    }

    fn lookup_repo(&self, name: &str) -> Result<Node, i32> {
        // A miss at the root is EPERM rather than ENOENT so the kernel
        // never treats the mount root as a place it may create entries.
        let mount = self.config.resolve(name).ok_or(EPERM)?;
        let repo = mount.commit.repo.clone();
        match self.runtime.block_on(self.client.inspect_repo(&repo)) {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Err(EPERM),
            Err(err) => return Err(map_hub_err(&err)),
        }
        if mount.commit.id.is_empty() {
            return Ok(Node::RepoDir(RepoNode {
                repo,
                alias: mount.alias,
                shard: mount.shard,
            }));
        }
        let commit = self
            .runtime
            .block_on(self.client.inspect_commit(&repo, &mount.commit.id))
            .map_err(|e| map_hub_err(&e))?;
        Ok(Node::Dir(DirNode {
            repo,
            commit: mount.commit.id,
            alias: mount.alias,
            shard: mount.shard,
            writable: commit.is_open(),
            modified: system_time(commit.finished),
            path: "/".to_string(),
        }))
    }

    fn lookup_commit(&self, repo: &RepoNode, name: &str) -> Result<Node, i32> {
        let commit = self
            .runtime
            .block_on(self.client.inspect_commit(&repo.repo, name))
            .map_err(|e| map_hub_err(&e))?;
        Ok(Node::Dir(DirNode {
            repo: repo.repo.clone(),
            commit: name.to_string(),
            alias: repo.alias.clone(),
            shard: repo.shard,
            writable: commit.is_open(),
            modified: system_time(commit.finished),
            path: "/".to_string(),
        }))
    }

    fn lookup_child(&self, dir: &DirNode, name: &str) -> Result<Node, i32> {
        let path = join_child(&dir.path, name);
        if dir.writable {
            // An open commit answers every lookup with an empty file: the
            // kernel looks a name up before removing it, and a failed
            // lookup would make the remove impossible.
            return Ok(Node::File(FileNode {
                repo: dir.repo.clone(),
                commit: dir.commit.clone(),
                alias: dir.alias.clone(),
                shard: dir.shard,
                path,
                size: 0,
                local: true,
                writable: true,
                modified: None,
            }));
        }
        let from = self.config.from_commit_id(dir.repo_or_alias());
        let info = match self.runtime.block_on(self.client.inspect_file(
            &dir.repo,
            &dir.commit,
            &path,
            from.as_deref(),
            dir.shard.as_ref(),
        )) {
            Ok(info) => info,
            Err(_) => return Err(ENOENT),
        };
        match info.kind {
            FileKind::Regular => Ok(Node::File(FileNode {
                repo: dir.repo.clone(),
                commit: dir.commit.clone(),
                alias: dir.alias.clone(),
                shard: dir.shard,
                path,
                size: info.size_bytes,
                local: false,
                writable: false,
                modified: system_time(info.modified),
            })),
            FileKind::Dir => Ok(Node::Dir(DirNode {
                repo: dir.repo.clone(),
                commit: dir.commit.clone(),
                alias: dir.alias.clone(),
                shard: dir.shard,
                writable: dir.writable,
                modified: dir.modified,
                path,
            })),
            FileKind::None => Err(EIO),
        }
    }

    // --- attributes -------------------------------------------------------

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<FileAttr, i32> {
        let node = self.inodes.node(ino).ok_or(ENOENT)?;
        match &node {
            Node::Root | Node::RepoDir(_) => Ok(dir_attr(ino, false, None)),
            Node::Dir(dir) => Ok(dir_attr(ino, dir.writable, dir.modified)),
            Node::File(file) => self.file_attr(ino, file),
        }
    }

    fn file_attr(&self, ino: u64, file: &FileNode) -> Result<FileAttr, i32> {
        if file.writable {
            // The hub has no authoritative size for a file in an open
            // commit; pretend it is empty.
            return Ok(reg_attr(ino, 0, file.modified));
        }
        let from = self.config.from_commit_id(file.repo_or_alias());
        match self.runtime.block_on(self.client.inspect_file(
            &file.repo,
            &file.commit,
            &file.path,
            from.as_deref(),
            file.shard.as_ref(),
        )) {
            Ok(info) => {
                let modified = system_time(info.modified);
                let mut refreshed = file.clone();
                refreshed.size = info.size_bytes;
                refreshed.modified = modified;
                self.inodes.remember(ino, &Node::File(refreshed));
                Ok(reg_attr(ino, info.size_bytes, modified))
            }
            // A freshly created file the hub does not know about yet.
            Err(_) if file.local => Ok(reg_attr(ino, 0, None)),
            Err(err) => Err(map_hub_err(&err)),
        }
    }

    fn node_attr(&self, ino: u64, node: &Node) -> FileAttr {
        match node {
            Node::Root | Node::RepoDir(_) => dir_attr(ino, false, None),
            Node::Dir(dir) => dir_attr(ino, dir.writable, dir.modified),
            Node::File(file) => {
                let size = if file.writable { 0 } else { file.size };
                reg_attr(ino, size, file.modified)
            }
        }
    }

    // --- directory listing ------------------------------------------------

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let node = self.inodes.node(ino).ok_or(ENOENT)?;
        let children = match &node {
            Node::Root => self.read_repos()?,
            Node::RepoDir(repo) => match self.config.resolve(repo.repo_or_alias()) {
                Some(mount) if !mount.commit.id.is_empty() => {
                    // The mount pins a commit: this directory serves the
                    // commit root rather than the list of commits.
                    let dir = DirNode {
                        repo: repo.repo.clone(),
                        commit: mount.commit.id.clone(),
                        alias: repo.alias.clone(),
                        shard: mount.shard,
                        writable: false,
                        modified: None,
                        path: "/".to_string(),
                    };
                    self.read_files(&dir)?
                }
                _ => self.read_commits(repo)?,
            },
            Node::Dir(dir) => self.read_files(dir)?,
            Node::File(_) => return Err(ENOTDIR),
        };

        let mut out = Vec::new();
        let mut idx: i64 = offset;
        if offset == 0 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
            out.push((ino, FileType::Directory, "..".to_string(), 2));
            idx = 2;
        }
        for (child_ino, file_type, name) in children.into_iter().skip((idx - 2).max(0) as usize) {
            idx += 1;
            out.push((child_ino, file_type, name, idx));
        }
        Ok(out)
    }

    fn read_repos(&self) -> Result<Vec<(u64, FileType, String)>, i32> {
        let mut out = Vec::new();
        if self.config.commit_mounts.is_empty() {
            let repos = self
                .runtime
                .block_on(self.client.list_repos())
                .map_err(|e| map_hub_err(&e))?;
            for repo in repos {
                let ino = self.inodes.get_or_allocate(&node_key(&repo.name, "", ""));
                out.push((ino, FileType::Directory, repo.name));
            }
        } else {
            for mount in &self.config.commit_mounts {
                let name = mount
                    .alias
                    .clone()
                    .unwrap_or_else(|| mount.commit.repo.clone());
                let path = if mount.commit.id.is_empty() { "" } else { "/" };
                let ino = self
                    .inodes
                    .get_or_allocate(&node_key(&mount.commit.repo, &mount.commit.id, path));
                out.push((ino, FileType::Directory, name));
            }
        }
        Ok(out)
    }

    fn read_commits(&self, repo: &RepoNode) -> Result<Vec<(u64, FileType, String)>, i32> {
        let commits = self
            .runtime
            .block_on(self.client.list_commits(&repo.repo))
            .map_err(|e| map_hub_err(&e))?;
        let mut out = Vec::new();
        for commit in commits {
            let ino = self
                .inodes
                .get_or_allocate(&node_key(&repo.repo, &commit.commit.id, "/"));
            out.push((ino, FileType::Directory, commit.commit.id));
        }
        Ok(out)
    }

    fn read_files(&self, dir: &DirNode) -> Result<Vec<(u64, FileType, String)>, i32> {
        let from = self.config.from_commit_id(dir.repo_or_alias());
        let files = self
            .runtime
            .block_on(self.client.list_files(
                &dir.repo,
                &dir.commit,
                &dir.path,
                from.as_deref(),
                dir.shard.as_ref(),
                // Non-recursive keeps listings cheap; subdirectory sizes
                // reported by attr are therefore not authoritative.
                false,
            ))
            .map_err(|e| map_hub_err(&e))?;

        let mut out = Vec::new();
        for info in files {
            let short = info
                .file
                .path
                .strip_prefix(dir.path.as_str())
                .unwrap_or(info.file.path.as_str())
                .trim_start_matches('/')
                .to_string();
            if short.is_empty() {
                continue;
            }
            let path = join_child(&dir.path, &short);
            let node = match info.kind {
                FileKind::Regular => Node::File(FileNode {
                    repo: dir.repo.clone(),
                    commit: dir.commit.clone(),
                    alias: dir.alias.clone(),
                    shard: dir.shard,
                    path,
                    size: info.size_bytes,
                    local: false,
                    writable: dir.writable,
                    modified: system_time(info.modified),
                }),
                FileKind::Dir => Node::Dir(DirNode {
                    repo: dir.repo.clone(),
                    commit: dir.commit.clone(),
                    alias: dir.alias.clone(),
                    shard: dir.shard,
                    writable: dir.writable,
                    modified: dir.modified,
                    path,
                }),
                // Entries of any other kind are silently skipped.
                FileKind::None => continue,
            };
            let ino = self.inodes.get_or_allocate(&key_of(&node));
            self.inodes.remember(ino, &node);
            let file_type = match &node {
                Node::File(_) => FileType::RegularFile,
                _ => FileType::Directory,
            };
            out.push((ino, file_type, short));
        }
        Ok(out)
    }

    // --- mutation ---------------------------------------------------------

    pub(crate) fn create_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr, u64), i32> {
        let parent_node = self.inodes.node(parent).ok_or(ENOENT)?;
        let dir = match &parent_node {
            Node::Dir(dir) if dir.writable => dir,
            _ => return Err(EPERM),
        };
        let file = FileNode {
            repo: dir.repo.clone(),
            commit: dir.commit.clone(),
            alias: dir.alias.clone(),
            shard: dir.shard,
            path: join_child(&dir.path, name),
            size: 0,
            local: true,
            writable: true,
            modified: None,
        };
        let node = Node::File(file.clone());
        let ino = self.inodes.get_or_allocate(&key_of(&node));
        self.inodes.remember(ino, &node);
        let fh = self.handles.insert(FileHandle {
            file,
            writer: None,
            written: 0,
        });
        let attr = self.node_attr(ino, &node);
        Ok((ino, attr, fh))
    }

    pub(crate) fn mkdir_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let parent_node = self.inodes.node(parent).ok_or(ENOENT)?;
        let dir = match &parent_node {
            Node::Dir(dir) if dir.writable => dir,
            _ => return Err(EPERM),
        };
        let path = join_child(&dir.path, name);
        self.runtime
            .block_on(
                self.client
                    .make_directory(&dir.repo, &dir.commit, &path),
            )
            .map_err(|e| map_hub_err(&e))?;
        let node = Node::Dir(DirNode {
            repo: dir.repo.clone(),
            commit: dir.commit.clone(),
            alias: dir.alias.clone(),
            shard: dir.shard,
            writable: dir.writable,
            modified: dir.modified,
            path,
        });
        let ino = self.inodes.get_or_allocate(&key_of(&node));
        self.inodes.remember(ino, &node);
        Ok((ino, self.node_attr(ino, &node)))
    }

    pub(crate) fn remove_entry(&self, parent: u64, name: &str) -> Result<(), i32> {
        let parent_node = self.inodes.node(parent).ok_or(ENOENT)?;
        let dir = match &parent_node {
            Node::Dir(dir) if dir.writable => dir,
            _ => return Err(EPERM),
        };
        let path = join_child(&dir.path, name);
        self.runtime
            .block_on(self.client.delete_file(&dir.repo, &dir.commit, &path))
            .map_err(|e| map_hub_err(&e))?;
        // No local bookkeeping: the next lookup reflects the hub's state
        // (or synthesizes an empty file in an open commit, which is what
        // the kernel is in the middle of removing anyway).
        Ok(())
    }

    // --- file I/O ---------------------------------------------------------

    pub(crate) fn open_entry(&self, ino: u64) -> Result<u64, i32> {
        let node = self.inodes.node(ino).ok_or(ENOENT)?;
        let file = match node {
            Node::File(file) => file,
            _ => return Err(EISDIR),
        };
        // Opening never contacts the hub; the writer is created lazily on
        // the first write.
        Ok(self.handles.insert(FileHandle {
            file,
            writer: None,
            written: 0,
        }))
    }

    pub(crate) fn read_entry(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        let node = self.inodes.node(ino).ok_or(ENOENT)?;
        let file = match &node {
            Node::File(file) => file,
            _ => return Err(EISDIR),
        };
        let from = self.config.from_commit_id(file.repo_or_alias());
        let mut sink = Cursor::new(Vec::with_capacity(size as usize));
        match self.runtime.block_on(self.client.get_file(
            &file.repo,
            &file.commit,
            &file.path,
            offset,
            size as u64,
            from.as_deref(),
            file.shard.as_ref(),
            &mut sink,
        )) {
            Ok(_) => Ok(sink.into_inner()),
            // A file in an open commit may not exist on the hub yet;
            // ENOENT out of read(2) would be nonsense, report EINVAL.
            Err(err) if err.is_not_found() => Err(EINVAL),
            Err(err) => Err(map_hub_err(&err)),
        }
    }

    pub(crate) fn write_handle(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize, i32> {
        self.handles.with_handle_mut(fh, |handle| {
            if !handle.file.writable {
                return Err(EPERM);
            }
            if handle.writer.is_none() {
                let writer = self
                    .runtime
                    .block_on(self.client.put_file_writer(
                        &handle.file.repo,
                        &handle.file.commit,
                        &handle.file.path,
                        &self.stream_id,
                    ))
                    .map_err(|e| map_hub_err(&e))?;
                handle.writer = Some(writer);
            }
            if offset > handle.written {
                // Non-seekable direct I/O rules out gaps in the offsets the
                // kernel hands us.
                warn!(
                    "write gap on {}: offset {} beyond {} written",
                    node_ident(&Node::File(handle.file.clone())),
                    offset,
                    handle.written
                );
                return Err(EINVAL);
            }
            // `repeated` is the prefix of this slice the hub already has:
            // some kernels (macOS) re-send the tail of the previous write
            // in the next call.
            let repeated = ((handle.written - offset) as usize).min(data.len());
            let fresh = &data[repeated..];
            let written = if fresh.is_empty() {
                0
            } else {
                let writer = handle.writer.as_mut().ok_or(EIO)?;
                self.runtime
                    .block_on(writer.write(fresh))
                    .map_err(|e| map_hub_err(&e))?
            };
            handle.written += written as u64;
            let end = offset + (repeated + written) as u64;
            if handle.file.size < end {
                handle.file.size = end;
            }
            Ok(written + repeated)
        })
    }

    pub(crate) fn flush_handle(&self, fh: u64) -> Result<(), i32> {
        self.handles.with_handle_mut(fh, |handle| {
            // `written` survives so a later write reopens the stream where
            // it left off.
            if let Some(mut writer) = handle.writer.take() {
                self.runtime
                    .block_on(writer.close())
                    .map_err(|e| map_hub_err(&e))?;
            }
            Ok(())
        })
    }

    pub(crate) fn release_handle(&self, fh: u64) {
        // The writer was already closed by flush/fsync; nothing to tell
        // the hub.
        self.handles.remove(fh);
    }
}

// ------------------------------
// FUSE glue
// ------------------------------

impl Filesystem for FsMount {
    fn lookup(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok((ino, attr)) => {
                debug!(
                    "lookup dir={} name={} node={} err=",
                    self.node_desc(parent),
                    name,
                    self.node_desc(ino)
                );
                reply.entry(&TTL, &attr, 0);
            }
            Err(code) => {
                debug!(
                    "lookup dir={} name={} err={}",
                    self.node_desc(parent),
                    name,
                    code
                );
                reply.error(code);
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok(attr) => {
                debug!(
                    "attr node={} mode={:o} size={} err=",
                    self.node_desc(ino),
                    attr.perm,
                    attr.size
                );
                reply.attr(&TTL, &attr);
            }
            Err(code) => {
                debug!("attr node={} err={}", self.node_desc(ino), code);
                reply.error(code);
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                debug!(
                    "readdir node={} offset={} entries={} err=",
                    self.node_desc(ino),
                    offset,
                    entries.len()
                );
                for (child_ino, file_type, name, next_offset) in entries {
                    if reply.add(child_ino, next_offset, file_type, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => {
                debug!("readdir node={} err={}", self.node_desc(ino), code);
                reply.error(code);
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_entry(ino) {
            Ok(fh) => {
                debug!("open node={} fh={} err=", self.node_desc(ino), fh);
                reply.opened(fh, FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE);
            }
            Err(code) => {
                debug!("open node={} err={}", self.node_desc(ino), code);
                reply.error(code);
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.create_entry(parent, name) {
            Ok((ino, attr, fh)) => {
                debug!(
                    "create dir={} name={} node={} err=",
                    self.node_desc(parent),
                    name,
                    self.node_desc(ino)
                );
                reply.created(&TTL, &attr, 0, fh, FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE);
            }
            Err(code) => {
                debug!(
                    "create dir={} name={} err={}",
                    self.node_desc(parent),
                    name,
                    code
                );
                reply.error(code);
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.mkdir_entry(parent, name) {
            Ok((ino, attr)) => {
                debug!(
                    "mkdir dir={} name={} node={} err=",
                    self.node_desc(parent),
                    name,
                    self.node_desc(ino)
                );
                reply.entry(&TTL, &attr, 0);
            }
            Err(code) => {
                debug!(
                    "mkdir dir={} name={} err={}",
                    self.node_desc(parent),
                    name,
                    code
                );
                reply.error(code);
            }
        }
    }

    fn unlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.remove_entry(parent, name) {
            Ok(()) => {
                debug!(
                    "remove dir={} name={} err=",
                    self.node_desc(parent),
                    name
                );
                reply.ok();
            }
            Err(code) => {
                debug!(
                    "remove dir={} name={} err={}",
                    self.node_desc(parent),
                    name,
                    code
                );
                reply.error(code);
            }
        }
    }

    fn rmdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        self.unlink(_req, parent, name, reply);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.read_entry(ino, offset as u64, size) {
            Ok(data) => {
                debug!(
                    "read node={} offset={} bytes={} err=",
                    self.node_desc(ino),
                    offset,
                    data.len()
                );
                reply.data(&data);
            }
            Err(code) => {
                debug!(
                    "read node={} offset={} err={}",
                    self.node_desc(ino),
                    offset,
                    code
                );
                reply.error(code);
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.write_handle(fh, offset as u64, data) {
            Ok(n) => {
                debug!(
                    "write node={} offset={} size={} err=",
                    self.node_desc(ino),
                    offset,
                    n
                );
                reply.written(n as u32);
            }
            Err(code) => {
                debug!(
                    "write node={} offset={} err={}",
                    self.node_desc(ino),
                    offset,
                    code
                );
                reply.error(code);
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_handle(fh) {
            Ok(()) => {
                debug!("flush node={} err=", self.node_desc(ino));
                reply.ok();
            }
            Err(code) => {
                debug!("flush node={} err={}", self.node_desc(ino), code);
                reply.error(code);
            }
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.flush_handle(fh) {
            Ok(()) => {
                debug!("fsync node={} err=", self.node_desc(ino));
                reply.ok();
            }
            Err(code) => {
                debug!("fsync node={} err={}", self.node_desc(ino), code);
                reply.error(code);
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.release_handle(fh);
        debug!("release node={} err=", self.node_desc(ino));
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }
}

// ------------------------------
// Attribute builders
// ------------------------------

fn dir_attr(ino: u64, writable: bool, modified: Option<SystemTime>) -> FileAttr {
    let perm = if writable { 0o775 } else { 0o555 };
    make_attr(ino, FileType::Directory, perm, 0, modified)
}

fn reg_attr(ino: u64, size: u64, modified: Option<SystemTime>) -> FileAttr {
    make_attr(ino, FileType::RegularFile, 0o666, size, modified)
}

fn make_attr(
    ino: u64,
    kind: FileType,
    perm: u16,
    size: u64,
    modified: Option<SystemTime>,
) -> FileAttr {
    let mtime = modified.unwrap_or(UNIX_EPOCH);
    FileAttr {
        ino,
        size,
        blocks: 1,
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

fn map_hub_err(err: &HubError) -> i32 {
    match err {
        HubError::NotFound(_) => ENOENT,
        HubError::AlreadyExists(_) => libc::EEXIST,
        HubError::PermissionDenied(_) => EPERM,
        HubError::InvalidParam(_) | HubError::InvalidData(_) => EINVAL,
        HubError::Cancelled(_) => libc::EINTR,
        HubError::IoError(_)
        | HubError::RemoteError(_)
        | HubError::DecodeError(_)
        | HubError::Internal(_) => EIO,
    }
}

// ------------------------------
// Mount lifecycle
// ------------------------------

#[derive(Debug, Clone)]
pub struct FsMountRunOptions {
    pub mountpoint: PathBuf,
    pub server_url: String,
    pub config_path: Option<PathBuf>,
    pub session_token: Option<String>,
}

pub fn load_mount_config(path: Option<&Path>) -> HubResult<MountConfig> {
    let Some(path) = path else {
        return Ok(MountConfig::empty());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| HubError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    let file: MountConfigFile = serde_json::from_str(&content)
        .map_err(|e| HubError::InvalidData(format!("parse {} failed: {}", path.display(), e)))?;
    file.into_config()
}

pub fn run_fs_mount(options: FsMountRunOptions) -> HubResult<()> {
    let runtime = Runtime::new().map_err(|e| HubError::Internal(e.to_string()))?;
    let config = load_mount_config(options.config_path.as_deref())?;
    let client: Arc<dyn HubClient> = Arc::new(HttpHubClient::new(
        &options.server_url,
        options.session_token.clone(),
    )?);

    let filesystem = FsMount::new(runtime, client, config);
    let mount_options = vec![
        MountOption::FSName("hubfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);
    info!(
        "mounting hubfs at {:?}, server={}",
        options.mountpoint, options.server_url
    );
    match fuser::spawn_mount2(filesystem, &options.mountpoint, &mount_options) {
        Ok(session) => {
            println!("hubfs mounted at {:?}", options.mountpoint);
            session.join();
            Ok(())
        }
        Err(err) => Err(HubError::IoError(format!("mount failed: {}", err))),
    }
}
