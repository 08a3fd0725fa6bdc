//! HTTP adapter for a REST document API
//!
//! Documents live under `/_api/database/{db}/document/{collection}/{key}`.
//! Responses carry the body fields plus `_key`, `_rev` and `_modified_at`
//! (unix millis). Applied writes are looked up under
//! `/_api/database/{db}/idempotency/{key}`.

use super::{RemoteRecord, RemoteStore, WriteReceipt};
use crate::error::{SyncError, SyncResult};
use crate::types::Document;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub struct HttpRemoteStore {
    base_url: String,
    database: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, database: &str, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            token: None,
            client,
        })
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    fn document_path(&self, collection: &str, id: &str) -> String {
        format!(
            "/_api/database/{}/document/{}/{}",
            self.database, collection, id
        )
    }

    fn headers(&self, idempotency_key: Option<&str>) -> SyncResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        }
        if let Some(key) = idempotency_key {
            headers.insert(IDEMPOTENCY_HEADER, header_value(key)?);
        }
        Ok(headers)
    }

    /// Send a request; `Ok(None)` for 404.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> SyncResult<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(self.headers(idempotency_key)?);
        if let Some(b) = body {
            request = request.json(b);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        debug!("{} {} -> {}", method, path, status);
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let text = response
            .text()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(classify(status, format!("HTTP {} {}: {}", status, path, text)));
        }
        if text.is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_str(&text)?))
    }
}

fn header_value(raw: &str) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(raw).map_err(|e| SyncError::Validation(format!("invalid header: {}", e)))
}

/// Map an HTTP failure status onto the retry classification.
pub fn classify(status: StatusCode, message: String) -> SyncError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            SyncError::Validation(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Authorization(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => SyncError::Conflict(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::Network(message),
        s if s.is_server_error() => SyncError::Network(message),
        _ => SyncError::Validation(message),
    }
}

/// Split a response body into document fields and system attributes.
pub fn parse_record(value: Value) -> SyncResult<RemoteRecord> {
    let Value::Object(mut body) = value else {
        return Err(SyncError::Serialization(
            "expected a JSON object document".into(),
        ));
    };

    let version = match body.remove("_rev") {
        Some(Value::String(rev)) => rev,
        Some(Value::Number(rev)) => rev.to_string(),
        _ => return Err(SyncError::Serialization("document without _rev".into())),
    };
    let modified_at = body.remove("_modified_at").and_then(|v| v.as_i64());

    let data: Document = body
        .into_iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .collect();

    Ok(RemoteRecord {
        data,
        version,
        modified_at,
    })
}

fn expect_record(value: Option<Value>, collection: &str, id: &str) -> SyncResult<RemoteRecord> {
    match value {
        Some(v) => parse_record(v),
        None => Err(SyncError::NotFound(format!("{}/{}", collection, id))),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(
        &self,
        collection: &str,
        id: &str,
        data: &Document,
        idempotency_key: &str,
    ) -> SyncResult<RemoteRecord> {
        let mut body = data.clone();
        body.insert("_key".to_string(), Value::String(id.to_string()));
        let path = format!("/_api/database/{}/document/{}", self.database, collection);
        let response = self
            .request(Method::POST, &path, Some(&Value::Object(body)), Some(idempotency_key))
            .await?;
        expect_record(response, collection, id)
    }

    async fn read(&self, collection: &str, id: &str) -> SyncResult<Option<RemoteRecord>> {
        let response = self
            .request(Method::GET, &self.document_path(collection, id), None, None)
            .await?;
        response.map(parse_record).transpose()
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
        idempotency_key: &str,
    ) -> SyncResult<RemoteRecord> {
        let response = self
            .request(
                Method::PATCH,
                &self.document_path(collection, id),
                Some(&Value::Object(patch.clone())),
                Some(idempotency_key),
            )
            .await?;
        expect_record(response, collection, id)
    }

    async fn delete(&self, collection: &str, id: &str, idempotency_key: &str) -> SyncResult<()> {
        // 404 means the document is already gone
        self.request(
            Method::DELETE,
            &self.document_path(collection, id),
            None,
            Some(idempotency_key),
        )
        .await?;
        Ok(())
    }

    async fn lookup(&self, idempotency_key: &str) -> SyncResult<Option<WriteReceipt>> {
        let path = format!("/_api/database/{}/idempotency/{}", self.database, idempotency_key);
        match self.request(Method::GET, &path, None, None).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
