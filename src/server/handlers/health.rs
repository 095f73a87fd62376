use axum::http::StatusCode;

/// Liveness probe for the trigger server and worker process
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}
