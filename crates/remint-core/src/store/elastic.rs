//! Elasticsearch / OpenSearch adapter.
//!
//! Reads use `search_after` over a stable sort field; the page token is the
//! sort tuple of the last hit. Writes use the `_bulk` endpoint with NDJSON
//! `update` actions carrying partial documents.

use std::fmt::{self, Write as _};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::debug;

use super::{BulkOptions, BulkWriter, RecordSource, StoreFuture};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{
    Batch, ENTITY_TYPE_FIELD, PARENT_TYPES_FIELD, Page, PageToken, Record, ScanPredicate,
};

/// HTTP client for a search cluster.
#[derive(Clone)]
pub struct ElasticStore {
    client: Client,
    base_url: String,
    page_size: usize,
    sort_field: String,
    request_timeout: Duration,
    credentials: Option<(String, Option<String>)>,
}

impl fmt::Debug for ElasticStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticStore")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .field("sort_field", &self.sort_field)
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

impl ElasticStore {
    /// Build a client from store configuration. Trailing slashes on the URL are stripped.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            page_size: config.page_size.max(1),
            sort_field: config.sort_field.clone(),
            request_timeout,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, password.as_deref()),
            None => req,
        }
    }

    /// Map a non-2xx response to a `StoreError`.
    async fn map_status(resp: reqwest::Response) -> StoreError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        StoreError::Http {
            status: status.as_u16(),
            body,
        }
    }

    /// Map a reqwest error (network/timeout) to a `StoreError`.
    fn map_network_error(e: reqwest::Error, timeout: Duration) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(timeout)
        } else if e.is_connect() {
            StoreError::Unavailable(format!("connection failed: {e}"))
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }

    async fn search(
        &self,
        predicate: &ScanPredicate,
        token: Option<&PageToken>,
    ) -> Result<Page, StoreError> {
        let url = format!("{}/{}/_search", self.base_url, predicate.indices.join(","));
        let body = search_body(predicate, self.page_size, &self.sort_field, token);
        debug!(url = %url, after = ?token, "fetching page");

        let resp = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| Self::map_network_error(e, self.request_timeout))?;
        if resp.status() != StatusCode::OK {
            return Err(Self::map_status(resp).await);
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        parse_search_response(&value, self.page_size)
    }

    async fn bulk(&self, batch: &Batch, options: BulkOptions) -> Result<(), StoreError> {
        let url = format!(
            "{}/_bulk?refresh={}&timeout={}ms",
            self.base_url,
            options.refresh,
            options.timeout.as_millis()
        );
        let resp = self
            .authorize(
                self.client
                    .post(&url)
                    .header("Content-Type", "application/x-ndjson")
                    .timeout(options.timeout)
                    .body(bulk_body(batch)),
            )
            .send()
            .await
            .map_err(|e| Self::map_network_error(e, options.timeout))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp).await);
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        parse_bulk_response(&value)
    }
}

impl RecordSource for ElasticStore {
    fn fetch_page<'a>(
        &'a self,
        predicate: &'a ScanPredicate,
        token: Option<&'a PageToken>,
    ) -> StoreFuture<'a, Page> {
        Box::pin(self.search(predicate, token))
    }
}

impl BulkWriter for ElasticStore {
    fn bulk_apply<'a>(&'a self, batch: &'a Batch, options: BulkOptions) -> StoreFuture<'a, ()> {
        Box::pin(self.bulk(batch, options))
    }
}

/// Search request body selecting records by own or parent type.
#[must_use]
pub fn search_body(
    predicate: &ScanPredicate,
    page_size: usize,
    sort_field: &str,
    token: Option<&PageToken>,
) -> Value {
    let type_key = format!("{ENTITY_TYPE_FIELD}.keyword");
    let parent_key = format!("{PARENT_TYPES_FIELD}.keyword");
    let mut body = json!({
        "size": page_size,
        "track_total_hits": false,
        "sort": [{ sort_field: "asc" }],
        "query": {
            "bool": {
                "should": [
                    { "terms": { type_key: predicate.entity_types } },
                    { "terms": { parent_key: predicate.entity_types } },
                ],
                "minimum_should_match": 1,
            }
        }
    });
    if let Some(token) = token {
        body["search_after"] = token.0.clone();
    }
    body
}

/// Convert a search response into a page. A full page carries a token; a
/// short page ends the scan.
pub fn parse_search_response(value: &Value, page_size: usize) -> Result<Page, StoreError> {
    let hits = value
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::InvalidResponse("missing hits.hits".to_string()))?;

    let mut records = Vec::with_capacity(hits.len());
    let mut last_sort = None;
    for hit in hits {
        let index = hit.get("_index").and_then(Value::as_str);
        let id = hit.get("_id").and_then(Value::as_str);
        let (Some(index), Some(id)) = (index, id) else {
            return Err(StoreError::InvalidResponse(
                "hit without _index or _id".to_string(),
            ));
        };
        let content = hit
            .get("_source")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        records.push(Record::new(index, id, content));
        last_sort = hit.get("sort").cloned();
    }

    let next = if records.len() >= page_size {
        Some(PageToken(last_sort.ok_or_else(|| {
            StoreError::InvalidResponse("hit without sort values".to_string())
        })?))
    } else {
        None
    };
    Ok(Page { records, next })
}

/// NDJSON body of `update` actions with partial documents.
#[must_use]
pub fn bulk_body(batch: &Batch) -> String {
    let mut body = String::new();
    for op in batch.operations() {
        let action = json!({
            "update": { "_index": op.target.location.as_str(), "_id": op.target.id.as_str() }
        });
        let doc = json!({ "doc": op.patch.to_doc() });
        let _ = writeln!(body, "{action}");
        let _ = writeln!(body, "{doc}");
    }
    body
}

/// Surface the first item-level failure of a bulk response.
pub fn parse_bulk_response(value: &Value) -> Result<(), StoreError> {
    let has_errors = value
        .get("errors")
        .and_then(Value::as_bool)
        .ok_or_else(|| StoreError::InvalidResponse("missing errors flag".to_string()))?;
    if !has_errors {
        return Ok(());
    }

    let items = value.get("items").and_then(Value::as_array);
    let failed = items.into_iter().flatten().find_map(|item| {
        let update = item.get("update")?;
        let error = update.get("error")?;
        Some((update, error))
    });
    match failed {
        Some((update, error)) => {
            let text = |v: &Value, key: &str| {
                v.get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let kind = text(error, "type");
            let reason = text(error, "reason");
            Err(StoreError::Rejected {
                location: text(update, "_index"),
                record_id: text(update, "_id"),
                reason: if kind.is_empty() {
                    reason
                } else {
                    format!("{kind}: {reason}")
                },
            })
        }
        None => Err(StoreError::InvalidResponse(
            "bulk reported errors but no failing item".to_string(),
        )),
    }
}
