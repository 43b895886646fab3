use crate::{CommitInfo, FileInfo, HubResult, RepoInfo, Shard};
use async_trait::async_trait;
use tokio::io::AsyncWrite;

/// Byte sink for an append stream opened with [`HubClient::put_file_writer`].
///
/// A writer belongs to exactly one open handle; `close` finishes the stream
/// and must be called exactly once. Dropping an unclosed writer abandons the
/// stream on the hub side.
#[async_trait]
pub trait FileWriter: Send + std::fmt::Debug {
    async fn write(&mut self, data: &[u8]) -> HubResult<usize>;
    async fn close(&mut self) -> HubResult<()>;
}

/// The narrow interface the filesystem adapter consumes.
///
/// `from_commit`, where accepted, is a diff base: listings, stats and
/// contents are interpreted as the delta since that commit. `shard`
/// restricts which files of the commit are visible.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn list_repos(&self) -> HubResult<Vec<RepoInfo>>;

    async fn inspect_repo(&self, repo: &str) -> HubResult<RepoInfo>;

    async fn list_commits(&self, repo: &str) -> HubResult<Vec<CommitInfo>>;

    async fn inspect_commit(&self, repo: &str, id: &str) -> HubResult<CommitInfo>;

    #[allow(clippy::too_many_arguments)]
    async fn list_files(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from_commit: Option<&str>,
        shard: Option<&Shard>,
        recurse: bool,
    ) -> HubResult<Vec<FileInfo>>;

    async fn inspect_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from_commit: Option<&str>,
        shard: Option<&Shard>,
    ) -> HubResult<FileInfo>;

    /// Streams up to `size` bytes starting at `offset` into `sink`,
    /// returning the number of bytes written.
    #[allow(clippy::too_many_arguments)]
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
    ) -> HubResult<u64>;

    /// Opens an append stream for `path` in an open commit. `handle_id`
    /// identifies the stream so the hub can reassemble one sequential byte
    /// sequence even when the kernel splits writes across calls.
    async fn put_file_writer(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        handle_id: &str,
    ) -> HubResult<Box<dyn FileWriter>>;

    async fn make_directory(&self, repo: &str, commit: &str, path: &str) -> HubResult<()>;

    async fn delete_file(&self, repo: &str, commit: &str, path: &str) -> HubResult<()>;
}
