use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Partition selector restricting which slice of a commit is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    #[serde(rename = "type")]
    pub shard_type: u32,
    pub modulus: u32,
}

impl Shard {
    /// Whether a file path falls into this shard.
    pub fn selects(&self, path: &str) -> bool {
        if self.modulus <= 1 {
            return true;
        }
        Self::hash_path(path) % self.modulus as u64 == self.shard_type as u64
    }

    /// Hash a path to get a deterministic partition bucket
    #[inline]
    fn hash_path(path: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        hasher.finish()
    }
}

/// A commit reference. An empty `id` means "not pinned".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    pub repo: String,
    #[serde(default)]
    pub id: String,
}

impl CommitRef {
    pub fn new(repo: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitKind {
    /// Finished, immutable.
    Read,
    /// Open, accepting appends.
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit: CommitRef,
    pub kind: CommitKind,
    #[serde(default)]
    pub started: Option<u64>,
    /// Unix seconds; set once the commit is finished.
    #[serde(default)]
    pub finished: Option<u64>,
}

impl CommitInfo {
    pub fn is_open(&self) -> bool {
        self.kind == CommitKind::Write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    None,
    Regular,
    Dir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub commit: CommitRef,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file: FileRef,
    pub kind: FileKind,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub modified: Option<u64>,
}
