use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, header};
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tracing::{debug, warn};

use super::sas_signer::{SasSigner, SigningError};
use crate::config::QueueSettings;
use crate::domain::messages::LockedMessage;
use crate::domain::ports::{EnqueueError, MessageReceiver, MessageSender, QueueError};

/// Broker metadata returned with a peek-locked message
const BROKER_PROPERTIES: &str = "BrokerProperties";

/// Extra time the HTTP client waits beyond the server-side long-poll window
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Limit response body size kept for error reporting
const MAX_ERROR_BODY: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    message_id: String,
    lock_token: String,
    delivery_count: u32,
    #[serde(default)]
    sequence_number: Option<i64>,
    #[serde(default)]
    locked_until_utc: Option<String>,
}

/// Failure to set up the queue transport. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    #[error("Failed to sign queue credential: {0}")]
    Signing(#[from] SigningError),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// REST transport for one brokered queue.
///
/// Sends go to `{base}{queue}/messages`; receives use peek-lock on
/// `{base}{queue}/messages/head` and settle through the returned lock URL.
pub struct ServiceBusClient {
    client: Client,
    base_address: String,
    queue_name: String,
    api_version: String,
    timeout: Duration,
    request_timeout: Duration,
    signer: SasSigner,
}

impl ServiceBusClient {
    /// Build the client and sign the first credential. Fails on malformed keys.
    pub fn new(settings: &QueueSettings) -> Result<Self, ClientBuildError> {
        let signer = SasSigner::new(
            settings.connection.base_address(),
            settings.connection.key_name(),
            settings.connection.key(),
        )?;

        Self::with_signer(settings, signer)
    }

    pub fn with_signer(
        settings: &QueueSettings,
        signer: SasSigner,
    ) -> Result<Self, ClientBuildError> {
        let request_timeout = Self::request_timeout_for(settings);
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("queue-relay/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_address: settings.connection.base_address().to_string(),
            queue_name: settings.queue_name.clone(),
            api_version: settings.api_version.clone(),
            timeout: settings.timeout,
            request_timeout,
            signer,
        })
    }

    /// HTTP timeout for a long-poll window of `settings.timeout`
    pub fn request_timeout_for(settings: &QueueSettings) -> Duration {
        settings.timeout + CLIENT_TIMEOUT_SLACK
    }

    /// Timeout applied to every HTTP request, always beyond the long-poll window
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Ingress address for new messages
    pub fn submission_url(&self) -> String {
        format!(
            "{}{}/messages?timeout={}&api-version={}",
            self.base_address,
            self.queue_name,
            self.timeout.as_secs(),
            self.api_version
        )
    }

    /// Peek-lock address for the next message
    pub fn receive_url(&self) -> String {
        format!(
            "{}{}/messages/head?timeout={}&api-version={}",
            self.base_address,
            self.queue_name,
            self.timeout.as_secs(),
            self.api_version
        )
    }

    /// Address of one locked delivery, used to complete or unlock it
    pub fn lock_url(&self, message: &LockedMessage) -> String {
        format!(
            "{}{}/messages/{}/{}?api-version={}",
            self.base_address,
            self.queue_name,
            url::form_urlencoded::byte_serialize(message.message_id.as_bytes()).collect::<String>(),
            url::form_urlencoded::byte_serialize(message.lock_token.as_bytes()).collect::<String>(),
            self.api_version
        )
    }

    async fn authorization(&self) -> Result<String, SigningError> {
        Ok(self.signer.credential().await?.authorization_header())
    }

    async fn settle(
        &self,
        method: Method,
        message: &LockedMessage,
    ) -> Result<(), QueueError> {
        let url = self.lock_url(message);
        let auth = self
            .authorization()
            .await
            .map_err(|e| QueueError::Signing(e.to_string()))?;

        let response = self
            .client
            .request(method.clone(), &url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(
                message_id = %message.message_id,
                method = %method,
                "Settled message"
            );
            return Ok(());
        }

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(QueueError::LockLost {
                message_id: message.message_id.clone(),
            });
        }

        Err(QueueError::UnexpectedStatus {
            status: status.as_u16(),
            body: read_error_body(response).await,
        })
    }
}

#[async_trait]
impl MessageSender for ServiceBusClient {
    async fn send(&self, body: &[u8]) -> Result<(), EnqueueError> {
        let url = self.submission_url();
        debug!(queue = %self.queue_name, bytes = body.len(), "Sending message");

        let auth = self
            .authorization()
            .await
            .map_err(|e| EnqueueError::Signing(e.to_string()))?;

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| {
                warn!(queue = %self.queue_name, error = %e, "Enqueue request failed");
                EnqueueError::Transport(e.to_string())
            })?;

        let status = response.status();
        debug!(
            queue = %self.queue_name,
            status = %status.as_u16(),
            response_time_ms = start.elapsed().as_millis() as u64,
            "Enqueue response received"
        );

        if !status.is_success() {
            return Err(EnqueueError::Rejected {
                status: status.as_u16(),
                body: read_error_body(response).await,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for ServiceBusClient {
    async fn receive(&self) -> Result<Option<LockedMessage>, QueueError> {
        let auth = self
            .authorization()
            .await
            .map_err(|e| QueueError::Signing(e.to_string()))?;

        let response = self
            .client
            .post(self.receive_url())
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => parse_locked_message(response).await.map(Some),
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::NOT_FOUND => Err(QueueError::EntityNotFound(self.queue_name.clone())),
            status => Err(QueueError::UnexpectedStatus {
                status: status.as_u16(),
                body: read_error_body(response).await,
            }),
        }
    }

    async fn complete(&self, message: &LockedMessage) -> Result<(), QueueError> {
        self.settle(Method::DELETE, message).await
    }

    async fn abandon(&self, message: &LockedMessage) -> Result<(), QueueError> {
        self.settle(Method::PUT, message).await
    }
}

async fn parse_locked_message(response: Response) -> Result<LockedMessage, QueueError> {
    let raw = response
        .headers()
        .get(BROKER_PROPERTIES)
        .ok_or_else(|| QueueError::InvalidEnvelope(format!("missing {BROKER_PROPERTIES} header")))?
        .to_str()
        .map_err(|e| QueueError::InvalidEnvelope(e.to_string()))?
        .to_string();

    let properties: BrokerProperties =
        serde_json::from_str(&raw).map_err(|e| QueueError::InvalidEnvelope(e.to_string()))?;

    let body = response
        .bytes()
        .await
        .map_err(|e| QueueError::Transport(format!("Failed to read message body: {e}")))?;

    let mut message = LockedMessage::new(
        properties.message_id,
        properties.lock_token,
        properties.delivery_count,
        body.to_vec(),
    );

    if let Some(sequence_number) = properties.sequence_number {
        message = message.with_sequence_number(sequence_number);
    }
    if let Some(locked_until) = properties
        .locked_until_utc
        .as_deref()
        .and_then(|s| OffsetDateTime::parse(s, &Rfc2822).ok())
    {
        message = message.with_locked_until(locked_until);
    }

    Ok(message)
}

async fn read_error_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) => String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_ERROR_BODY)]).to_string(),
        Err(e) => format!("<unreadable body: {e}>"),
    }
}
