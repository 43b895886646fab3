use crate::client::{FileWriter, HubClient};
use crate::{CommitInfo, FileInfo, HubError, HubResult, RepoInfo, Shard};
use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Thin adapter over the hub's HTTP surface.
///
/// The adapter layer above imposes no per-operation timeouts; the request
/// timeout configured here is the only deadline in the stack.
#[derive(Debug)]
pub struct HttpHubClient {
    base_url: Url,
    http: Client,
    session_token: Option<String>,
}

impl HttpHubClient {
    pub fn new(base_url: &str, session_token: Option<String>) -> HubResult<Self> {
        Self::with_timeout(base_url, session_token, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        session_token: Option<String>,
        timeout: Duration,
    ) -> HubResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| HubError::InvalidParam(format!("invalid hub url {}: {}", base_url, e)))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Internal(format!("build http client failed: {}", e)))?;
        Ok(Self {
            base_url,
            http,
            session_token,
        })
    }

    fn api_url(&self, segments: &[&str]) -> HubResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| HubError::InvalidParam("hub url cannot be a base".to_string()))?
            .extend(segments);
        Ok(url)
    }

    fn commit_url(&self, repo: &str, commit: &str, tail: &str) -> HubResult<Url> {
        self.api_url(&["repos", repo, "commits", commit, tail])
    }

    fn apply_read_args(url: &mut Url, path: &str, from_commit: Option<&str>, shard: Option<&Shard>) {
        let mut query = url.query_pairs_mut();
        query.append_pair("path", path);
        if let Some(from) = from_commit {
            query.append_pair("from", from);
        }
        if let Some(shard) = shard {
            query.append_pair("shard_type", &shard.shard_type.to_string());
            query.append_pair("shard_modulus", &shard.modulus.to_string());
        }
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.session_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn check_status(response: reqwest::Response) -> HubResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let info = response.text().await.unwrap_or_default();
        let info = if info.is_empty() { url } else { info };
        Err(HubError::from_http_status(status, info))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> HubResult<T> {
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = Self::check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| HubError::DecodeError(format!("decode hub response failed: {}", e)))
    }

    async fn send_empty(&self, method: reqwest::Method, url: Url) -> HubResult<()> {
        let response = self
            .request(method, url)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        Self::check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl HubClient for HttpHubClient {
    async fn list_repos(&self) -> HubResult<Vec<RepoInfo>> {
        self.get_json(self.api_url(&["repos"])?).await
    }

    async fn inspect_repo(&self, repo: &str) -> HubResult<RepoInfo> {
        self.get_json(self.api_url(&["repos", repo])?).await
    }

    async fn list_commits(&self, repo: &str) -> HubResult<Vec<CommitInfo>> {
        self.get_json(self.api_url(&["repos", repo, "commits"])?)
            .await
    }

    async fn inspect_commit(&self, repo: &str, id: &str) -> HubResult<CommitInfo> {
        self.get_json(self.api_url(&["repos", repo, "commits", id])?)
            .await
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
        let mut url = self.commit_url(repo, commit, "files")?;
        Self::apply_read_args(&mut url, path, from_commit, shard);
        if recurse {
            url.query_pairs_mut().append_pair("recurse", "true");
        }
        self.get_json(url).await
    }

    async fn inspect_file(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        from_commit: Option<&str>,
        shard: Option<&Shard>,
    ) -> HubResult<FileInfo> {
        let mut url = self.commit_url(repo, commit, "stat")?;
        Self::apply_read_args(&mut url, path, from_commit, shard);
        self.get_json(url).await
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
        let mut url = self.commit_url(repo, commit, "data")?;
        Self::apply_read_args(&mut url, path, from_commit, shard);
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("size", &size.to_string());
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let mut response = Self::check_status(response).await?;
        let mut total = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_err)? {
            sink.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    async fn put_file_writer(
        &self,
        repo: &str,
        commit: &str,
        path: &str,
        handle_id: &str,
    ) -> HubResult<Box<dyn FileWriter>> {
        let mut append_url = self.commit_url(repo, commit, "append")?;
        let mut close_url = self.commit_url(repo, commit, "close")?;
        for url in [&mut append_url, &mut close_url] {
            url.query_pairs_mut()
                .append_pair("path", path)
                .append_pair("handle", handle_id);
        }
        Ok(Box::new(HttpFileWriter {
            http: self.http.clone(),
            session_token: self.session_token.clone(),
            append_url,
            close_url,
            closed: false,
        }))
    }

    async fn make_directory(&self, repo: &str, commit: &str, path: &str) -> HubResult<()> {
        let mut url = self.commit_url(repo, commit, "dirs")?;
        url.query_pairs_mut().append_pair("path", path);
        self.send_empty(reqwest::Method::POST, url).await
    }

    async fn delete_file(&self, repo: &str, commit: &str, path: &str) -> HubResult<()> {
        let mut url = self.commit_url(repo, commit, "files")?;
        url.query_pairs_mut().append_pair("path", path);
        self.send_empty(reqwest::Method::DELETE, url).await
    }
}

/// Append-stream writer: each segment is posted against the same
/// `(path, handle)` pair so the hub sees one sequential stream.
#[derive(Debug)]
struct HttpFileWriter {
    http: Client,
    session_token: Option<String>,
    append_url: Url,
    close_url: Url,
    closed: bool,
}

impl HttpFileWriter {
    fn request(&self, url: &Url) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url.clone());
        if let Some(token) = &self.session_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl FileWriter for HttpFileWriter {
    async fn write(&mut self, data: &[u8]) -> HubResult<usize> {
        if self.closed {
            return Err(HubError::InvalidParam("write on closed writer".to_string()));
        }
        let response = self
            .request(&self.append_url)
            .body(data.to_vec())
            .send()
            .await
            .map_err(map_reqwest_err)?;
        HttpHubClient::check_status(response).await?;
        Ok(data.len())
    }

    async fn close(&mut self) -> HubResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let response = self
            .request(&self.close_url)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        HttpHubClient::check_status(response).await?;
        Ok(())
    }
}

impl Drop for HttpFileWriter {
    fn drop(&mut self) {
        if !self.closed {
            warn!("append stream dropped without close: {}", self.append_url);
        }
    }
}

fn map_reqwest_err(err: reqwest::Error) -> HubError {
    if err.is_timeout() {
        HubError::Cancelled(format!("request timed out: {}", err))
    } else {
        HubError::RemoteError(err.to_string())
    }
}
