//! HTTP access to resource-status and log endpoints.

use crate::config::{join_path, ClientConfig, Credential};
use crate::error::{LiveError, Result};
use crate::logs::{LogCursor, LogItemReference, LogLine, LogPage, LogSource};
use crate::model::ResourceSnapshot;
use crate::poller::PollSource;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{StatusCode, Url};

pub const TOTAL_COUNT_HEADER: &str = "X-Total-Count";

/// Outcome of a fetch against an endpoint that may not be populated yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Ready(T),
    NotReady,
}

/// Which retry policy applies to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Auth-scoped resource status (polled and watched resources).
    Resource,
    /// Log lines and downloads.
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Ready,
    NotReady,
    Transient,
    Fatal,
}

pub fn classify(class: EndpointClass, status: StatusCode) -> StatusOutcome {
    if status.is_success() {
        return StatusOutcome::Ready;
    }
    match (class, status.as_u16()) {
        (_, 401 | 403) => StatusOutcome::Fatal,
        (EndpointClass::Resource, 404) => StatusOutcome::Fatal,
        (EndpointClass::Resource, s) if s >= 400 => StatusOutcome::NotReady,
        (EndpointClass::Log, 404) => StatusOutcome::NotReady,
        (EndpointClass::Log, 408 | 425 | 429) => StatusOutcome::Transient,
        (EndpointClass::Log, s) if s >= 500 => StatusOutcome::Transient,
        _ => StatusOutcome::Fatal,
    }
}

fn status_error(status: StatusCode, url: &Url) -> LiveError {
    match status {
        StatusCode::UNAUTHORIZED => LiveError::Unauthorized(url.to_string()),
        StatusCode::FORBIDDEN => LiveError::Forbidden(url.to_string()),
        StatusCode::NOT_FOUND => LiveError::NotFound(url.to_string()),
        s => LiveError::Status {
            status: s.as_u16(),
            url: url.to_string(),
        },
    }
}

/// Total line count from the response headers, if the server sent one.
pub fn parse_total_count(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(TOTAL_COUNT_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Log-lines body. An empty body or JSON `null` is an empty page.
pub fn parse_lines(body: &str) -> Result<Vec<LogLine>> {
    let body = body.trim();
    if body.is_empty() || body == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(body)?)
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    cdn_url: Url,
    credential: Option<Credential>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("cdn_url", &self.cdn_url.as_str())
            .field("credential", &self.credential)
            .finish()
    }
}

impl ApiClient {
    pub fn new(cfg: &ClientConfig, credential: Option<Credential>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .connect_timeout(cfg.transport.connect_timeout)
            .build()
            .map_err(|e| LiveError::Config(format!("http client: {e}")))?;
        let parse = |s: &str| {
            Url::parse(s).map_err(|e| LiveError::Config(format!("invalid url '{s}': {e}")))
        };
        Ok(Self {
            http,
            base_url: parse(&cfg.base_url)?,
            cdn_url: parse(cfg.cdn_base())?,
            credential,
        })
    }

    pub fn resource_url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        url.set_path(&join_path(self.base_url.path(), path));
        url.set_query(query);
        url
    }

    fn item_url(&self, item: &LogItemReference, leaf: &str) -> Url {
        let mut url = self.cdn_url.clone();
        let path = format!(
            "item/{}/{}/{}",
            item.item_type.as_str(),
            item.api_ref_hash,
            leaf
        );
        url.set_path(&join_path(self.cdn_url.path(), &path));
        url
    }

    pub fn lines_url(&self, item: &LogItemReference, cursor: LogCursor) -> Url {
        let mut url = self.item_url(item, "lines");
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("offset", &cursor.offset.to_string());
            if cursor.count > 0 {
                q.append_pair("limit", &cursor.count.to_string());
            }
        }
        url
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        match &self.credential {
            Some(c) => req.header(AUTHORIZATION, c.header_value()),
            None => req,
        }
    }

    async fn send(&self, class: EndpointClass, url: Url) -> Result<Fetched<reqwest::Response>> {
        tracing::trace!(url = %url, "GET");
        let resp = self.get(url.clone()).send().await?;
        let status = resp.status();
        match classify(class, status) {
            StatusOutcome::Ready => Ok(Fetched::Ready(resp)),
            StatusOutcome::NotReady => {
                tracing::debug!(url = %url, status = status.as_u16(), "not ready");
                Ok(Fetched::NotReady)
            }
            StatusOutcome::Transient => Err(LiveError::Network(format!(
                "{url} answered {status}"
            ))),
            StatusOutcome::Fatal => Err(status_error(status, &url)),
        }
    }

    /// `GET {api}/{path}` decoded as a resource snapshot.
    pub async fn get_resource(&self, path: &str) -> Result<Fetched<ResourceSnapshot>> {
        let resp = match self.send(EndpointClass::Resource, self.resource_url(path)).await? {
            Fetched::Ready(r) => r,
            Fetched::NotReady => return Ok(Fetched::NotReady),
        };
        let body: serde_json::Value = serde_json::from_slice(&resp.bytes().await?)?;
        Ok(Fetched::Ready(ResourceSnapshot::from_value(body)?))
    }

    /// One page of log lines starting at `cursor.offset`.
    pub async fn fetch_lines(
        &self,
        item: &LogItemReference,
        cursor: LogCursor,
    ) -> Result<Fetched<LogPage>> {
        let resp = match self.send(EndpointClass::Log, self.lines_url(item, cursor)).await? {
            Fetched::Ready(r) => r,
            Fetched::NotReady => return Ok(Fetched::NotReady),
        };
        let total = parse_total_count(resp.headers());
        let lines = parse_lines(&resp.text().await?)?;
        let total_count = total.unwrap_or(cursor.offset + lines.len() as u64);
        Ok(Fetched::Ready(LogPage { lines, total_count }))
    }

    /// Full raw log text.
    pub async fn download(&self, item: &LogItemReference) -> Result<Fetched<String>> {
        match self.send(EndpointClass::Log, self.item_url(item, "download")).await? {
            Fetched::Ready(r) => Ok(Fetched::Ready(r.text().await?)),
            Fetched::NotReady => Ok(Fetched::NotReady),
        }
    }
}

impl LogSource for ApiClient {
    fn fetch_lines<'a>(
        &'a self,
        item: &'a LogItemReference,
        cursor: LogCursor,
    ) -> BoxFuture<'a, Result<Fetched<LogPage>>> {
        Box::pin(ApiClient::fetch_lines(self, item, cursor))
    }
}

/// A resource-status endpoint polled through an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ResourceEndpoint {
    client: ApiClient,
    path: String,
}

impl ResourceEndpoint {
    pub fn new(client: ApiClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

impl PollSource for ResourceEndpoint {
    fn fetch(&self) -> BoxFuture<'_, Result<Fetched<ResourceSnapshot>>> {
        Box::pin(self.client.get_resource(&self.path))
    }

    fn name(&self) -> &str {
        &self.path
    }
}
