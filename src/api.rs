use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::config::ApiConfig;
use crate::models::RawAttempt;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("response from {url} is not a JSON array")]
    NotAnArray { url: String },
}

/// Where raw attempts come from for one ingestion window.
#[async_trait]
pub trait AttemptSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RawAttempt>, FetchError>;
}

pub struct ApiClient {
    http: Client,
    cfg: ApiConfig,
}

impl ApiClient {
    pub fn new(cfg: ApiConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn http_err(&self, source: reqwest::Error) -> FetchError {
        FetchError::Http {
            url: self.cfg.url.clone(),
            source,
        }
    }
}

#[async_trait]
impl AttemptSource for ApiClient {
    async fn fetch(&self) -> Result<Vec<RawAttempt>, FetchError> {
        tracing::info!(url = %self.cfg.url, start = %self.cfg.start, end = %self.cfg.end, "requesting attempts");
        let body: Value = self
            .http
            .get(&self.cfg.url)
            .query(&[
                ("client", self.cfg.client.as_str()),
                ("client_key", self.cfg.client_key.as_str()),
                ("start", self.cfg.start.as_str()),
                ("end", self.cfg.end.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.http_err(e))?
            .json()
            .await
            .map_err(|e| self.http_err(e))?;

        let rows = rows_from_body(body).ok_or_else(|| FetchError::NotAnArray {
            url: self.cfg.url.clone(),
        })?;
        tracing::info!(rows = rows.len(), "attempts received");
        Ok(rows)
    }
}

fn rows_from_body(body: Value) -> Option<Vec<RawAttempt>> {
    let Value::Array(items) = body else {
        return None;
    };
    Some(
        items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item {
                Value::Object(map) => Some(RawAttempt(map)),
                other => {
                    tracing::debug!(index, kind = json_kind(&other), "skipping non-object row");
                    None
                }
            })
            .collect(),
    )
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
