use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::domain::messages::{CompletionReport, UpdateResult};
use crate::domain::ports::{RecordUpdater, TokenProvider, UpdateError};

/// Limit response body size kept for error reporting
const MAX_ERROR_BODY: usize = 4 * 1024;

/// Where and how completion reports are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStoreTarget {
    /// e.g. `https://org.example.net`
    pub instance_url: String,

    /// e.g. `9.2`
    pub api_version: String,

    pub entity_set: String,

    /// Boolean column set once the deferred work is done
    pub completion_field: String,

    /// Text column receiving the result payload
    pub result_field: String,
}

impl RecordStoreTarget {
    /// `{instance_url}/api/data/v{api_version}`
    pub fn base_uri(&self) -> String {
        format!(
            "{}/api/data/v{}",
            self.instance_url.trim_end_matches('/'),
            self.api_version
        )
    }

    /// Address of a single record: `{base}/{entity_set}({id})`, with the id percent-encoded
    pub fn record_url(&self, id: &str) -> String {
        format!(
            "{}/{}({})",
            self.base_uri(),
            self.entity_set,
            url::form_urlencoded::byte_serialize(id.as_bytes()).collect::<String>()
        )
    }

    /// JSON body for the conditional update
    pub fn update_body(&self, report: &CompletionReport) -> Value {
        let mut body = Map::new();
        body.insert(self.completion_field.clone(), Value::Bool(report.completed));
        body.insert(self.result_field.clone(), Value::String(report.result.clone()));
        Value::Object(body)
    }
}

/// Web API client that applies completion reports with `PATCH` + `If-Match: *`.
///
/// The precondition makes the update fail with 404 instead of creating a new
/// record when the target was deleted. Applying the same report twice leaves
/// the record in the same state.
pub struct WebApiClient {
    client: Client,
    target: RecordStoreTarget,
    tokens: Arc<dyn TokenProvider>,
}

impl WebApiClient {
    pub fn new(
        target: RecordStoreTarget,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("queue-relay/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            target,
            tokens,
        })
    }

    pub fn target(&self) -> &RecordStoreTarget {
        &self.target
    }
}

#[async_trait]
impl RecordUpdater for WebApiClient {
    async fn apply(&self, report: &CompletionReport) -> Result<UpdateResult, UpdateError> {
        let url = self.target.record_url(&report.correlation_id);
        let token = self.tokens.access_token().await?;

        debug!(url = %url, "Updating record");
        let start = Instant::now();

        let response = self
            .client
            .patch(&url)
            .bearer_auth(token)
            .header(header::IF_MATCH, "*")
            .header(header::ACCEPT, "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .json(&self.target.update_body(report))
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Record update request failed");
                UpdateError::Transport(e.to_string())
            })?;

        let status = response.status();
        debug!(
            url = %url,
            status = %status.as_u16(),
            response_time_ms = start.elapsed().as_millis() as u64,
            "Record update response received"
        );

        if status.is_success() {
            return Ok(UpdateResult::Applied);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(UpdateResult::NotFound);
        }

        let body = match response.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_ERROR_BODY)]).to_string(),
            Err(e) => format!("<unreadable body: {e}>"),
        };

        Err(UpdateError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        })
    }
}
