use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;

use crate::server::AppState;
use crate::server::responses::ResponseBody;
use crate::trigger::TriggerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventReceipt {
    pub record_id: String,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /records/{record_id}/events`
///
/// Returns only after the queue accepted the message, so a non-2xx answer tells
/// the caller to abort its transaction.
pub async fn record_event(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> ResponseBody<EventReceipt> {
    match state.trigger.on_business_event(&record_id).await {
        Ok(()) => ResponseBody::new(
            StatusCode::ACCEPTED,
            EventReceipt {
                record_id,
                queued: true,
                error: None,
            },
        ),
        Err(e) => {
            let status = match e {
                TriggerError::InvalidRecordId(_) => StatusCode::BAD_REQUEST,
                TriggerError::Enqueue(_) => StatusCode::BAD_GATEWAY,
            };
            ResponseBody::new(
                status,
                EventReceipt {
                    record_id,
                    queued: false,
                    error: Some(e.to_string()),
                },
            )
        }
    }
}
