use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::WrapErr;
use queue_relay::config::{Config, TokenProviderKind};
use queue_relay::domain::ports::TokenProvider;
use queue_relay::outbound::record_store::{
    ClientCredentialsTokenProvider, RecordStoreTarget, StaticTokenProvider, WebApiClient,
};
use queue_relay::outbound::servicebus::ServiceBusClient;
use queue_relay::server::Server;
use queue_relay::telemetry;
use queue_relay::trigger::RecordEventTrigger;
use queue_relay::worker::{DeferredWorkProcessor, QueueConsumer, RetryStrategy};
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    telemetry::init_tracing();

    // Load configuration; every failure below is fatal at startup
    let config = Config::load()?;
    tracing::info!("Loaded configuration: {:?}", config);
    config.validate_worker()?;

    let queue_settings = config.queue_settings()?;
    let queue = Arc::new(ServiceBusClient::new(&queue_settings)?);

    let request_timeout = Duration::from_secs(config.downstream.request_timeout_secs);
    let tokens: Arc<dyn TokenProvider> = match config.token_provider_kind()? {
        TokenProviderKind::Static { token } => Arc::new(StaticTokenProvider::new(token)),
        TokenProviderKind::ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope,
        } => Arc::new(ClientCredentialsTokenProvider::new(
            token_url,
            client_id,
            client_secret,
            scope,
            request_timeout,
        )?),
    };

    let target = RecordStoreTarget {
        instance_url: config.downstream.instance_url.clone(),
        api_version: config.downstream.api_version.clone(),
        entity_set: config.downstream.entity_set.clone(),
        completion_field: config.downstream.completion_field.clone(),
        result_field: config.downstream.result_field.clone(),
    };
    let updater = Arc::new(
        WebApiClient::new(target, tokens, request_timeout)
            .wrap_err("Failed to build record store HTTP client")?,
    );

    let processor = Arc::new(
        DeferredWorkProcessor::new(updater, config.downstream.result_payload.clone())
            .with_work_delay(Duration::from_millis(config.worker.simulated_delay_ms)),
    );

    let consumer = QueueConsumer::new(queue.clone(), processor)
        .with_max_in_flight(config.worker.max_in_flight)
        .with_backoff(RetryStrategy::new(
            config.worker.backoff_base_ms,
            config.worker.backoff_max_ms,
        ))
        .with_abandon_on_failure(config.worker.abandon_on_failure);

    let server = Server::new(&config.server, RecordEventTrigger::new(queue)).await?;

    let ctx = CancellationToken::new();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
        }
        shutdown.cancel();
    });

    tracing::info!(queue = %queue_settings.queue_name, "Starting queue relay");

    let (server_result, consumer_result) =
        tokio::join!(server.run_until(ctx.clone()), async {
            let result = consumer.run(ctx.clone()).await;
            // A consumer that stops on its own takes the server down with it
            ctx.cancel();
            result
        });

    server_result?;
    consumer_result?;
    Ok(())
}
