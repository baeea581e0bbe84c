//! `http`: issues one outbound request and classifies failures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{ExecutableNode, NodeError, traits::ExecutionContext};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Request settings read from the node input (static config plus upstream
/// data).  Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpNodeConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_on_status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub retry_on_network_errors: bool,
}

/// Trim, drop one stray leading `@`, default to `https://`.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Retry decision for a failed request.  `status` is `None` when no
/// response was received.
pub fn should_retry(status: Option<u16>, config: &HttpNodeConfig, ctx: &ExecutionContext) -> bool {
    if ctx.retries_exhausted() {
        return false;
    }
    match status {
        None => config.retry_on_network_errors,
        Some(code) => match &config.retry_on_status_codes {
            Some(codes) => codes.contains(&code),
            None => code >= 500,
        },
    }
}

/// `min(1000 * 2^retry_count, 30000)` milliseconds.
pub fn retry_delay_suggestion(retry_count: u32) -> Duration {
    let ms = 2u64
        .saturating_pow(retry_count)
        .saturating_mul(1_000)
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// Read the request settings from `input.config` when it is an object,
/// otherwise from `input` itself.
pub fn resolve_config(input: Value) -> Result<HttpNodeConfig, NodeError> {
    let source = match input.get("config") {
        Some(nested @ Value::Object(_)) => nested.clone(),
        _ => input,
    };
    serde_json::from_value(source).map_err(|e| NodeError::Invalid(format!("invalid http config: {e}")))
}

/// The configured timeout, clamped to the attempt's time budget so an
/// over-long request fails here, under this node's own retry rules.
pub fn request_timeout(config: &HttpNodeConfig, ctx: &ExecutionContext) -> Duration {
    let configured = Duration::from_millis(config.timeout.unwrap_or(DEFAULT_TIMEOUT_MS));
    match ctx.time_budget {
        Some(budget) => configured.min(budget),
        None => configured,
    }
}

pub struct HttpNode {
    client: Client,
}

impl HttpNode {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn failure(
        &self,
        message: String,
        status: Option<u16>,
        config: &HttpNodeConfig,
        ctx: &ExecutionContext,
    ) -> NodeError {
        if should_retry(status, config, ctx) {
            NodeError::Retryable {
                message,
                retry_after: Some(retry_delay_suggestion(ctx.retry_count)),
            }
        } else {
            NodeError::Fatal(message)
        }
    }
}

#[async_trait]
impl ExecutableNode for HttpNode {
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let config = resolve_config(input)?;

        let raw_url = config
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| NodeError::Invalid("URL is required for HTTP tasks".into()))?;
        let cleaned = normalize_url(raw_url);
        let url = Url::parse(&cleaned)
            .map_err(|_| NodeError::Invalid(format!("Invalid URL: {raw_url}")))?;

        let method_name = config.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| NodeError::Invalid(format!("Invalid HTTP method: {method_name}")))?;

        let timeout = request_timeout(&config, ctx);
        let mut request = self.client.request(method.clone(), url.clone()).timeout(timeout);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match &config.body {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(other) => request = request.json(other),
        }

        debug!(node_id = %ctx.node_id, %method, %url, "sending http request");
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(node_id = %ctx.node_id, %url, error = %err, "http request failed");
                return Err(self.failure(err.to_string(), None, &config, ctx));
            }
        };

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_string();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_string(), json!(text));
            }
        }

        if !status.is_success() {
            let message = format!("Request failed with status code {}", status.as_u16());
            warn!(node_id = %ctx.node_id, %url, status = status.as_u16(), "http request returned an error status");
            return Err(self.failure(message, Some(status.as_u16()), &config, ctx));
        }

        let text = response
            .text()
            .await
            .map_err(|e| self.failure(e.to_string(), None, &config, ctx))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let pretty = serde_json::to_string_pretty(&data).unwrap_or_default();
        let log_message = format!(
            "HTTP {method} {url} - Status: {} {status_text}\nResponse Data: {pretty}",
            status.as_u16()
        );

        Ok(json!({
            "status": status.as_u16(),
            "statusText": status_text,
            "headers": headers,
            "data": data,
            "logMessage": log_message,
        }))
    }
}
