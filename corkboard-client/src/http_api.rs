/// REST client for the authoritative board store.
///
/// Paths:
///   GET    {base}/{kind}s?parentId=..   list
///   GET    {base}/{kind}s/{id}          get
///   POST   {base}/{kind}s               create (body carries parentId)
///   PATCH  {base}/{kind}s/{id}          update / move
///   DELETE {base}/{kind}s/{id}          delete
///   GET    {base}/health                ping
///
/// Transport failures and gateway statuses (502/503/504) are `Unreachable`
/// so the engine queues the write; every other failure status is `Rejected`.
use std::time::Duration;

use async_trait::async_trait;
use corkboard_core::api::{ApiError, BoardApi};
use corkboard_core::types::{Entity, EntityKind};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use serde_json::Value;

pub struct HttpBoardApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBoardApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/{}", self.base_url, kind.collection())
    }

    fn entity_url(&self, kind: EntityKind, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(kind),
            utf8_percent_encode(id, NON_ALPHANUMERIC)
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    ApiError::Unreachable(e.to_string())
}

/// Classify a non-success response.
fn status_error(status: StatusCode, body: String) -> ApiError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ApiError::Unreachable(format!("{}", status))
        }
        _ => {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| {
                    if body.is_empty() {
                        status.canonical_reason().unwrap_or("error").to_string()
                    } else {
                        body
                    }
                });
            ApiError::rejected(status.as_u16(), message)
        }
    }
}

/// Parse a record, filling in `kind` when the server omits it.
fn parse_entity(kind: EntityKind, mut value: Value) -> Result<Entity, ApiError> {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("kind")
            .or_insert_with(|| serde_json::to_value(kind).unwrap_or(Value::Null));
    }
    serde_json::from_value(value)
        .map_err(|e| ApiError::rejected(0, format!("Malformed {} record: {}", kind, e)))
}

/// Decode a success body. The server has already applied the write, so an
/// unreadable body is `Rejected`: queueing it for replay would apply it twice.
async fn read_json(response: reqwest::Response) -> Result<Value, ApiError> {
    response
        .json::<Value>()
        .await
        .map_err(|e| ApiError::rejected(0, format!("Unreadable response body: {}", e)))
}

#[async_trait]
impl BoardApi for HttpBoardApi {
    async fn list(&self, kind: EntityKind, parent_id: &str) -> Result<Vec<Entity>, ApiError> {
        let request = self
            .client
            .get(self.collection_url(kind))
            .query(&[("parentId", parent_id)]);
        let body = read_json(self.send(request).await?).await?;
        let items = match body {
            Value::Array(items) => items,
            other => {
                return Err(ApiError::rejected(
                    0,
                    format!("Expected a list of {}, got {}", kind.collection(), other),
                ))
            }
        };
        items
            .into_iter()
            .map(|item| parse_entity(kind, item))
            .collect()
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Entity, ApiError> {
        let request = self.client.get(self.entity_url(kind, id));
        parse_entity(kind, read_json(self.send(request).await?).await?)
    }

    async fn create(
        &self,
        kind: EntityKind,
        parent_id: Option<&str>,
        payload: &Value,
    ) -> Result<Entity, ApiError> {
        let mut body = payload.clone();
        if let (Some(parent), Some(obj)) = (parent_id, body.as_object_mut()) {
            obj.insert("parentId".into(), Value::String(parent.to_string()));
        }
        let request = self.client.post(self.collection_url(kind)).json(&body);
        parse_entity(kind, read_json(self.send(request).await?).await?)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Entity, ApiError> {
        let request = self.client.patch(self.entity_url(kind, id)).json(payload);
        parse_entity(kind, read_json(self.send(request).await?).await?)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        let request = self.client.delete(self.entity_url(kind, id));
        self.send(request).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let request = self.client.get(format!("{}/health", self.base_url));
        self.send(request).await?;
        Ok(())
    }
}
