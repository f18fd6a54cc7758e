//! REST client for PostgREST-style backends
//!
//! Tables live under `/rest/v1/{table}` and remote procedures under
//! `/rest/v1/rpc/{name}`. Every request carries the API key both as an
//! `apikey` header and as a bearer token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

use super::{RemoteBackend, TENANT_FIELD};
use crate::shared::config::SyncConfig;
use crate::shared::error::SyncError;
use crate::shared::timestamp::{to_canonical, ID_FIELD, UPDATED_AT_FIELD};

/// HTTP implementation of [`RemoteBackend`]
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpBackend {
    /// Create a new client
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Create a client from the engine configuration
    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        if config.backend_url.is_empty() {
            return Err(SyncError::internal("backend_url is not configured"));
        }
        Self::new(
            config.backend_url.clone(),
            config.api_key.clone(),
            config.request_timeout(),
        )
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc_url(&self, name: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, name)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SyncError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| status.to_string());
        Err(SyncError::from_status(status.as_u16(), body))
    }

    async fn fetch_rows(&self, request: RequestBuilder) -> Result<Vec<Value>, SyncError> {
        let response = self.send(request).await?;
        let rows: Vec<Value> = response.json().await?;
        Ok(rows)
    }
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

/// Total from a `Content-Range: 0-9/123` header
fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

fn scoped(record: &Value, tenant: &str) -> Value {
    let mut record = record.clone();
    if let Some(object) = record.as_object_mut() {
        object
            .entry(TENANT_FIELD.to_string())
            .or_insert_with(|| Value::String(tenant.to_string()));
    }
    record
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn fetch_changes(
        &self,
        table: &str,
        tenant: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, SyncError> {
        let mut query: Vec<(String, String)> = vec![
            ("select".into(), "*".into()),
            (TENANT_FIELD.into(), eq(tenant)),
            ("order".into(), format!("{}.asc,{}.asc", UPDATED_AT_FIELD, ID_FIELD)),
        ];
        if let Some(since) = since {
            query.push((UPDATED_AT_FIELD.into(), format!("gte.{}", to_canonical(&since))));
        }

        tracing::debug!("[Remote] GET {} since {:?}", table, since);
        self.fetch_rows(self.client.get(self.table_url(table)).query(&query))
            .await
    }

    async fn fetch_recent(
        &self,
        table: &str,
        tenant: &str,
        limit: usize,
    ) -> Result<Vec<Value>, SyncError> {
        let query = [
            ("select", "*".to_string()),
            (TENANT_FIELD, eq(tenant)),
            ("order", format!("{}.desc", UPDATED_AT_FIELD)),
            ("limit", limit.to_string()),
        ];
        self.fetch_rows(self.client.get(self.table_url(table)).query(&query))
            .await
    }

    async fn count(&self, table: &str, tenant: &str) -> Result<u64, SyncError> {
        let query = [("select", ID_FIELD.to_string()), (TENANT_FIELD, eq(tenant))];
        let response = self
            .send(
                self.client
                    .head(self.table_url(table))
                    .query(&query)
                    .header("Prefer", "count=exact"),
            )
            .await?;

        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| SyncError::Backend {
                status: 0,
                message: format!("missing row count for {}", table),
            })
    }

    async fn upsert(&self, table: &str, tenant: &str, record: &Value) -> Result<(), SyncError> {
        let body = Value::Array(vec![scoped(record, tenant)]);
        self.send(
            self.client
                .post(self.table_url(table))
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        tenant: &str,
        id: &str,
        patch: &Value,
    ) -> Result<(), SyncError> {
        let query = [(ID_FIELD, eq(id)), (TENANT_FIELD, eq(tenant))];
        self.send(
            self.client
                .patch(self.table_url(table))
                .query(&query)
                .header("Prefer", "return=minimal")
                .json(patch),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, table: &str, tenant: &str, id: &str) -> Result<(), SyncError> {
        let query = [(ID_FIELD, eq(id)), (TENANT_FIELD, eq(tenant))];
        self.send(self.client.delete(self.table_url(table)).query(&query))
            .await?;
        Ok(())
    }

    async fn call_rpc(&self, name: &str, args: &Value) -> Result<Value, SyncError> {
        let result = self
            .send(self.client.post(self.rpc_url(name)).json(args))
            .await;

        let response = match result {
            Ok(response) => response,
            // A rejected procedure call is a business-rule failure
            Err(SyncError::Backend { status, message }) if (400..500).contains(&status) => {
                return Err(SyncError::business_rule(format!("{}: {}", name, message)));
            }
            Err(e) => return Err(e),
        };

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn ping(&self) -> Result<(), SyncError> {
        self.send(self.client.get(format!("{}/rest/v1/", self.base_url)))
            .await?;
        Ok(())
    }
}
