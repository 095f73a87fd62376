pub async fn home() -> &'static str {
    "Queue Relay"
}
