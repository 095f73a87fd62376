#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, patch, post};
use axum::{Json, Router};
use queue_relay::config::{Config, QueueSettings, ServerConfig};
use queue_relay::outbound::InMemoryQueue;
use queue_relay::outbound::servicebus::ConnectionString;
use queue_relay::server::Server;
use queue_relay::trigger::RecordEventTrigger;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub const SHARED_KEY: &str = "c2VjcmV0a2V5PT0=";
pub const KEY_NAME: &str = "RootManageSharedAccessKey";

/// Spawn the trigger server backed by an in-memory queue
pub async fn spawn_server() -> (String, Arc<InMemoryQueue>) {
    let queue = Arc::new(InMemoryQueue::with_timings(
        Duration::from_secs(30),
        Duration::from_millis(20),
    ));
    let addr = spawn_server_with(RecordEventTrigger::new(queue.clone())).await;
    (addr, queue)
}

pub async fn spawn_server_with(trigger: RecordEventTrigger) -> String {
    let config = ServerConfig {
        host: "localhost".to_string(),
        port: 0,
    };

    let server = Server::new(&config, trigger).await.unwrap();

    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.run());

    format!("http://{}:{}", config.host, port)
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Fake brokered queue REST endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    /// Path and query, e.g. `/samplequeue/messages?timeout=60&api-version=2013-08`
    pub uri: String,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct BrokerMessage {
    id: String,
    body: Vec<u8>,
    delivery_count: u32,
    lock_token: Option<String>,
}

#[derive(Debug, Default)]
pub struct BrokerState {
    pub requests: Vec<RecordedRequest>,
    /// Status returned by the ingress endpoint; 201 when unset
    pub ingress_status: Option<u16>,
    messages: Vec<BrokerMessage>,
    next_id: u64,
    pub completed: Vec<String>,
}

impl BrokerState {
    pub fn stored_bodies(&self) -> Vec<Vec<u8>> {
        self.messages.iter().map(|m| m.body.clone()).collect()
    }

    /// Release every lock, as if the lock duration had elapsed
    pub fn expire_locks(&mut self) {
        for message in &mut self.messages {
            message.lock_token = None;
        }
    }

    pub fn locked_count(&self) -> usize {
        self.messages.iter().filter(|m| m.lock_token.is_some()).count()
    }
}

pub type SharedBroker = Arc<Mutex<BrokerState>>;

/// Spawn a fake broker; returns its base address (with trailing `/`) and state
pub async fn spawn_fake_broker() -> (String, SharedBroker) {
    let state: SharedBroker = Arc::new(Mutex::new(BrokerState::default()));

    let router = Router::new()
        .route("/{queue}/messages", post(broker_send))
        .route("/{queue}/messages/head", post(broker_receive))
        .route("/{queue}/messages/{id}/{lock}", any(broker_settle))
        .with_state(state.clone());

    (format!("{}/", serve(router).await), state)
}

fn record(method: Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> RecordedRequest {
    RecordedRequest {
        method,
        uri: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
    }
}

async fn broker_send(
    State(state): State<SharedBroker>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let mut broker = state.lock().await;
    broker
        .requests
        .push(record(Method::POST, &uri, &headers, &body));

    if let Some(status) = broker.ingress_status {
        return StatusCode::from_u16(status).unwrap();
    }

    broker.next_id += 1;
    let id = format!("msg-{}", broker.next_id);
    broker.messages.push(BrokerMessage {
        id,
        body: body.to_vec(),
        delivery_count: 0,
        lock_token: None,
    });
    StatusCode::CREATED
}

async fn broker_receive(
    State(state): State<SharedBroker>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let mut broker = state.lock().await;
    broker.requests.push(record(Method::POST, &uri, &headers, &[]));

    let Some(message) = broker.messages.iter_mut().find(|m| m.lock_token.is_none()) else {
        drop(broker);
        // Stand-in for the long-poll window
        tokio::time::sleep(Duration::from_millis(20)).await;
        return StatusCode::NO_CONTENT.into_response();
    };

    message.delivery_count += 1;
    let token = uuid::Uuid::new_v4().to_string();
    message.lock_token = Some(token.clone());

    let properties = serde_json::json!({
        "DeliveryCount": message.delivery_count,
        "LockToken": token,
        "LockedUntilUtc": "Sat, 10 Feb 2024 14:31:00 GMT",
        "MessageId": message.id,
        "SequenceNumber": 1,
        "State": "Active",
    });

    (
        StatusCode::CREATED,
        [("BrokerProperties", properties.to_string())],
        message.body.clone(),
    )
        .into_response()
}

async fn broker_settle(
    State(state): State<SharedBroker>,
    Path((_queue, id, lock)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> StatusCode {
    let mut broker = state.lock().await;
    broker.requests.push(record(method.clone(), &uri, &headers, &[]));

    let Some(position) = broker
        .messages
        .iter()
        .position(|m| m.id == id && m.lock_token.as_deref() == Some(lock.as_str()))
    else {
        return StatusCode::NOT_FOUND;
    };

    match method {
        Method::DELETE => {
            let message = broker.messages.remove(position);
            broker.completed.push(message.id);
            StatusCode::OK
        }
        Method::PUT => {
            broker.messages[position].lock_token = None;
            StatusCode::OK
        }
        _ => StatusCode::METHOD_NOT_ALLOWED,
    }
}

pub fn queue_settings(base_address: &str, queue_name: &str) -> QueueSettings {
    let connection = ConnectionString::parse(&format!(
        "Endpoint={base_address};SharedAccessKeyName={KEY_NAME};SharedAccessKey={SHARED_KEY}"
    ))
    .unwrap();

    QueueSettings {
        connection,
        queue_name: queue_name.to_string(),
        api_version: "2013-08".to_string(),
        timeout: Duration::from_secs(60),
    }
}

// ---------------------------------------------------------------------------
// Fake record store Web API
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordStoreState {
    pub records: HashMap<String, Map<String, Value>>,
    /// Statuses returned before normal handling resumes
    pub scripted_statuses: VecDeque<u16>,
    pub patch_count: usize,
    pub last_if_match: Option<String>,
    pub last_authorization: Option<String>,
}

impl RecordStoreState {
    pub fn insert_record(&mut self, id: &str) {
        self.records.insert(id.to_string(), Map::new());
    }
}

pub type SharedRecordStore = Arc<Mutex<RecordStoreState>>;

/// Spawn a fake record store; returns its instance URL and state
pub async fn spawn_fake_record_store() -> (String, SharedRecordStore) {
    let state: SharedRecordStore = Arc::new(Mutex::new(RecordStoreState::default()));

    let router = Router::new()
        .route("/api/data/{version}/{entity}", patch(record_patch))
        .with_state(state.clone());

    (serve(router).await, state)
}

async fn record_patch(
    State(state): State<SharedRecordStore>,
    Path((_version, entity)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Map<String, Value>>,
) -> StatusCode {
    let mut store = state.lock().await;
    store.patch_count += 1;
    store.last_if_match = headers
        .get("if-match")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    store.last_authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(status) = store.scripted_statuses.pop_front() {
        return StatusCode::from_u16(status).unwrap();
    }

    let id = entity
        .split_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(')'))
        .unwrap_or_default()
        .to_string();

    match store.records.get_mut(&id) {
        Some(record) => {
            record.extend(body);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

pub fn required_config_vars(connection_string: &str, instance_url: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("queue.connection_string".to_string(), connection_string.to_string());
    vars.insert("downstream.instance_url".to_string(), instance_url.to_string());
    vars.insert("downstream.bearer_token".to_string(), "test-token".to_string());
    vars
}

pub fn load_config(vars: HashMap<String, String>) -> Config {
    Config::load_with_sources(Some(vars)).unwrap()
}
