use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Method, Response};
use sdlc_auth::Credentials;
use serde::de::DeserializeOwned;
use tracing::Instrument;
use url::Url;

use crate::error::GitLabError;
use crate::models::{Branch, Commit, Job, MergeRequest, Pipeline, Project, Tag, TreeEntry, User};

const PAGE_SIZE: &str = "100";
const MAX_PAGES: usize = 1000;

/// Receives one event per backend call attempt.
pub trait CallObserver: Send + Sync {
    fn observe(&self, operation: &'static str, outcome: &'static str, latency: Duration);
}

#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

#[derive(Clone)]
pub struct GitLabClient {
    base_url: Url,
    http: reqwest::Client,
    timeout: Duration,
    retry_backoff: Duration,
    observer: Option<Arc<dyn CallObserver>>,
}

impl std::fmt::Debug for GitLabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabClient")
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

impl GitLabClient {
    pub fn new(config: GitLabClientConfig) -> Result<Self, GitLabError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|err| GitLabError::InvalidUrl(format!("{}: {}", config.base_url, err)))?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(GitLabError::InvalidUrl(format!(
                "{}: expected an http(s) base URL",
                config.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(GitLabError::from)?;

        Ok(Self {
            base_url,
            http,
            timeout: config.timeout,
            retry_backoff: config.retry_backoff,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn for_credentials(&self, credentials: Credentials) -> GitLabApi {
        GitLabApi {
            client: self.clone(),
            credentials,
        }
    }

    pub async fn ping(&self) -> Result<(), GitLabError> {
        let url = self.endpoint(&["version"])?;
        let response = self.http.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(GitLabError::from_status(status.as_u16(), b""));
        }
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GitLabError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GitLabError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "v4"])
            .extend(segments.iter().copied());
        Ok(url)
    }

    fn observe(&self, operation: &'static str, outcome: &'static str, latency: Duration) {
        if let Some(observer) = &self.observer {
            observer.observe(operation, outcome, latency);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineFilter<'a> {
    Ref(&'a str),
    Sha(&'a str),
}

#[derive(Debug, Clone)]
pub struct GitLabApi {
    client: GitLabClient,
    credentials: Credentials,
}

impl GitLabApi {
    pub async fn current_user(&self) -> Result<User, GitLabError> {
        let url = self.client.endpoint(&["user"])?;
        self.get_json("current_user", url).await
    }

    pub async fn project(&self, project_id: u64) -> Result<Project, GitLabError> {
        let url = self
            .client
            .endpoint(&["projects", &project_id.to_string()])?;
        self.get_json("get_project", url).await
    }

    pub async fn branch(&self, project_id: u64, name: &str) -> Result<Branch, GitLabError> {
        let url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "repository",
            "branches",
            name,
        ])?;
        self.get_json("get_branch", url).await
    }

    pub async fn tag(&self, project_id: u64, name: &str) -> Result<Tag, GitLabError> {
        let url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "repository",
            "tags",
            name,
        ])?;
        self.get_json("get_tag", url).await
    }

    pub async fn commit(&self, project_id: u64, sha: &str) -> Result<Commit, GitLabError> {
        let url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "repository",
            "commits",
            sha,
        ])?;
        self.get_json("get_commit", url).await
    }

    pub async fn merge_request(
        &self,
        project_id: u64,
        merge_request_iid: u64,
    ) -> Result<MergeRequest, GitLabError> {
        let url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "merge_requests",
            &merge_request_iid.to_string(),
        ])?;
        self.get_json("get_merge_request", url).await
    }

    pub async fn merge_base(
        &self,
        project_id: u64,
        first: &str,
        second: &str,
    ) -> Result<Commit, GitLabError> {
        let mut url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "repository",
            "merge_base",
        ])?;
        url.query_pairs_mut()
            .append_pair("refs[]", first)
            .append_pair("refs[]", second);
        self.get_json("get_merge_base", url).await
    }

    /// Recursive listing of everything under `path` at `git_ref`.
    pub async fn tree(
        &self,
        project_id: u64,
        path: &str,
        git_ref: &str,
    ) -> Result<Vec<TreeEntry>, GitLabError> {
        let mut url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "repository",
            "tree",
        ])?;
        {
            let mut query = url.query_pairs_mut();
            if !path.is_empty() {
                query.append_pair("path", path);
            }
            query
                .append_pair("ref", git_ref)
                .append_pair("recursive", "true");
        }
        self.get_paged("list_tree", url).await
    }

    pub async fn raw_file(
        &self,
        project_id: u64,
        file_path: &str,
        git_ref: &str,
    ) -> Result<Bytes, GitLabError> {
        let mut url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "repository",
            "files",
            file_path,
            "raw",
        ])?;
        url.query_pairs_mut().append_pair("ref", git_ref);
        let response = self.get("read_file", &url, true).await?;
        Ok(response.bytes().await?)
    }

    pub async fn pipelines(
        &self,
        project_id: u64,
        filter: PipelineFilter<'_>,
    ) -> Result<Vec<Pipeline>, GitLabError> {
        let mut url = self
            .client
            .endpoint(&["projects", &project_id.to_string(), "pipelines"])?;
        let (key, value) = match filter {
            PipelineFilter::Ref(git_ref) => ("ref", git_ref),
            PipelineFilter::Sha(sha) => ("sha", sha),
        };
        url.query_pairs_mut().append_pair(key, value);
        self.get_paged("list_pipelines", url).await
    }

    pub async fn pipeline(&self, project_id: u64, pipeline_id: u64) -> Result<Pipeline, GitLabError> {
        let url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "pipelines",
            &pipeline_id.to_string(),
        ])?;
        self.get_json("get_pipeline", url).await
    }

    pub async fn pipeline_jobs(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<Vec<Job>, GitLabError> {
        let url = self.client.endpoint(&[
            "projects",
            &project_id.to_string(),
            "pipelines",
            &pipeline_id.to_string(),
            "jobs",
        ])?;
        self.get_paged("list_pipeline_jobs", url).await
    }

    pub async fn job(&self, project_id: u64, job_id: u64) -> Result<Job, GitLabError> {
        let url = self.job_url(project_id, job_id, None)?;
        self.get_json("get_job", url).await
    }

    // Only the response head is bounded by the per-call timeout.
    pub async fn job_trace(
        &self,
        project_id: u64,
        job_id: u64,
    ) -> Result<BoxStream<'static, Result<Bytes, GitLabError>>, GitLabError> {
        let url = self.job_url(project_id, job_id, Some("trace"))?;
        let response = self.get("get_job_trace", &url, false).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GitLabError::from))
            .boxed())
    }

    pub async fn play_job(&self, project_id: u64, job_id: u64) -> Result<Job, GitLabError> {
        let url = self.job_url(project_id, job_id, Some("play"))?;
        self.post_json("play_job", url).await
    }

    pub async fn retry_job(&self, project_id: u64, job_id: u64) -> Result<Job, GitLabError> {
        let url = self.job_url(project_id, job_id, Some("retry"))?;
        self.post_json("retry_job", url).await
    }

    pub async fn cancel_job(&self, project_id: u64, job_id: u64) -> Result<Job, GitLabError> {
        let url = self.job_url(project_id, job_id, Some("cancel"))?;
        self.post_json("cancel_job", url).await
    }

    fn job_url(&self, project_id: u64, job_id: u64, action: Option<&str>) -> Result<Url, GitLabError> {
        let project_id = project_id.to_string();
        let job_id = job_id.to_string();
        let mut segments = vec!["projects", project_id.as_str(), "jobs", job_id.as_str()];
        segments.extend(action);
        self.client.endpoint(&segments)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: Url,
    ) -> Result<T, GitLabError> {
        let response = self.get(operation, &url, true).await?;
        decode_json(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: Url,
    ) -> Result<T, GitLabError> {
        let response = self.send(operation, Method::POST, &url, 1, true).await?;
        decode_json(response).await
    }

    async fn get_paged<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: Url,
    ) -> Result<Vec<T>, GitLabError> {
        let mut items = Vec::new();
        let mut page = Some("1".to_string());
        let mut pages = 0usize;

        while let Some(current) = page.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(GitLabError::InvalidResponse(format!(
                    "{} exceeded {} pages",
                    operation, MAX_PAGES
                )));
            }

            let mut page_url = url.clone();
            page_url
                .query_pairs_mut()
                .append_pair("per_page", PAGE_SIZE)
                .append_pair("page", &current);

            let response = self.get(operation, &page_url, true).await?;
            let next = response
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim())
                .filter(|v| !v.is_empty() && *v != current)
                .map(|v| v.to_string());

            let batch = decode_json::<Vec<T>>(response).await?;
            items.extend(batch);
            page = next;
        }

        Ok(items)
    }

    /// Idempotent reads get one retry on transient failure.
    async fn get(
        &self,
        operation: &'static str,
        url: &Url,
        bounded: bool,
    ) -> Result<Response, GitLabError> {
        match self.send(operation, Method::GET, url, 1, bounded).await {
            Err(err) if err.is_transient() => {
                tracing::debug!(operation, error = %err, "retrying gitlab call");
                tokio::time::sleep(self.client.retry_backoff).await;
                self.send(operation, Method::GET, url, 2, bounded).await
            }
            other => other,
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        url: &Url,
        attempt: u32,
        bounded: bool,
    ) -> Result<Response, GitLabError> {
        let span = tracing::info_span!(
            "gitlab.call",
            operation,
            method = %method,
            attempt,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let started = Instant::now();

        async move {
            let (header_name, header_value) = self.credentials.header();
            let request = self
                .client
                .http
                .request(method, url.clone())
                .header(header_name, header_value);

            let sent = if bounded {
                request
                    .timeout(self.client.timeout)
                    .send()
                    .await
                    .map_err(GitLabError::from)
            } else {
                match tokio::time::timeout(self.client.timeout, request.send()).await {
                    Ok(res) => res.map_err(GitLabError::from),
                    Err(_) => Err(GitLabError::Timeout),
                }
            };

            let result = match sent {
                Ok(response) if response.status().is_success() => {
                    tracing::Span::current().record("status_code", response.status().as_u16());
                    Ok(response)
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    tracing::Span::current().record("status_code", status);
                    let body = response.bytes().await.unwrap_or_default();
                    Err(GitLabError::from_status(status, &body))
                }
                Err(err) => Err(err),
            };

            let latency = started.elapsed();
            let outcome = match &result {
                Ok(_) => "ok",
                Err(GitLabError::Timeout) => "timeout",
                Err(_) => "error",
            };
            tracing::Span::current().record("latency_ms", latency.as_millis() as u64);
            tracing::Span::current().record("outcome", outcome);
            self.client.observe(operation, outcome, latency);

            result
        }
        .instrument(span)
        .await
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, GitLabError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice::<T>(&bytes).map_err(|err| GitLabError::InvalidResponse(err.to_string()))
}
