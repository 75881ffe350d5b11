use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use shared::{domain::MemoryId, error::ApiError, protocol::MemoryRecord};
use tracing::{debug, info};
use url::Url;

use crate::error::MemoryApiError;

/// REST surface over the backend's long-term memory store.
#[async_trait]
pub trait MemoryApi: Send + Sync {
    async fn list(&self) -> Result<Vec<MemoryRecord>, MemoryApiError>;
    async fn delete(&self, id: &MemoryId) -> Result<(), MemoryApiError>;
    /// Deletes every record whose timestamp falls in `start..=end`.
    async fn delete_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), MemoryApiError>;
    async fn delete_all(&self) -> Result<(), MemoryApiError>;
}

/// `GET /memories` answers either with a bare record list or, on newer
/// backends, with a prebuilt graph whose nodes carry the record as
/// `details`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Records(Vec<MemoryRecord>),
    Graph { nodes: Vec<GraphNodeBody> },
}

#[derive(Deserialize)]
struct GraphNodeBody {
    #[serde(default)]
    details: MemoryRecord,
}

impl ListResponse {
    fn into_records(self) -> Vec<MemoryRecord> {
        match self {
            ListResponse::Records(records) => records,
            ListResponse::Graph { nodes } => nodes.into_iter().map(|node| node.details).collect(),
        }
    }
}

#[derive(Clone)]
pub struct HttpMemoryApi {
    http: reqwest::Client,
    base: Url,
}

impl HttpMemoryApi {
    pub fn new(backend_url: &str) -> Result<Self, MemoryApiError> {
        let base =
            Url::parse(backend_url).map_err(|_| MemoryApiError::InvalidUrl(backend_url.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(MemoryApiError::InvalidUrl(backend_url.to_string()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, MemoryApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MemoryApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl MemoryApi for HttpMemoryApi {
    async fn list(&self) -> Result<Vec<MemoryRecord>, MemoryApiError> {
        let response = self.http.get(self.endpoint(&["memories"])?).send().await?;
        let body = checked(response, None).await?.text().await?;
        let records = serde_json::from_str::<ListResponse>(&body)
            .map_err(MemoryApiError::Decode)?
            .into_records();
        debug!(count = records.len(), "fetched memories");
        Ok(records)
    }

    async fn delete(&self, id: &MemoryId) -> Result<(), MemoryApiError> {
        let response = self
            .http
            .delete(self.endpoint(&["memories", id.as_str()])?)
            .send()
            .await?;
        checked(response, Some(id)).await?;
        info!(%id, "memory deleted");
        Ok(())
    }

    async fn delete_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), MemoryApiError> {
        let (start, end) = (range_bound(start), range_bound(end));
        let response = self
            .http
            .delete(self.endpoint(&["memories", "range"])?)
            .query(&[("start", start.as_str()), ("end", end.as_str())])
            .send()
            .await?;
        checked(response, None).await?;
        info!(%start, %end, "memory range deleted");
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), MemoryApiError> {
        let response = self
            .http
            .delete(self.endpoint(&["memories", "all"])?)
            .send()
            .await?;
        checked(response, None).await?;
        info!("all memories deleted");
        Ok(())
    }
}

/// Formats a range bound the way browsers serialize dates:
/// `2024-05-01T00:00:00.000Z`.
pub fn range_bound(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn checked(response: Response, id: Option<&MemoryId>) -> Result<Response, MemoryApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if let (StatusCode::NOT_FOUND, Some(id)) = (status, id) {
        return Err(MemoryApiError::NotFound(id.clone()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(status.as_u16(), &body).into())
}

#[cfg(test)]
#[path = "tests/memory_api_tests.rs"]
mod tests;
