//! Identity service entry point.
//!
//! Wires configuration, storage, the delivery queue and the identity provider, then
//! serves the operational API until shutdown.
use anyhow::Context;
use identity::app::{AppState, build_router};
use identity::config::{IdentityConfig, StorageBackend};
use identity::delivery::ChannelDeliveryQueue;
use identity::model::DeliveryKey;
use identity::observability;
use identity::phone::PrefixTableDetector;
use identity::provider::IdentityProvider;
use identity::store::memory::InMemoryStore;
use identity::store::postgres::PostgresStore;
use identity::store::IdentityProviderStore;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

const SERVICE_NAME: &str = "masque-identity";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IdentityConfig::from_env_or_yaml().context("identity config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: IdentityConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability(SERVICE_NAME);
    let (state, receiver) = build_state(&config).await?;
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));
    let handoff_task = tokio::spawn(log_handoffs(receiver));

    let app = build_router(state);
    let addr = config.bind_addr;
    tracing::info!(%addr, "identity service listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::pin!(shutdown);
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result?;
        }
        _ = &mut shutdown => {}
    }

    metrics_task.abort();
    handoff_task.abort();
    let _ = metrics_task.await;
    let _ = handoff_task.await;
    Ok(())
}

async fn build_state(
    config: &IdentityConfig,
) -> anyhow::Result<(AppState, mpsc::Receiver<Vec<DeliveryKey>>)> {
    let store: Arc<dyn IdentityProviderStore> = match config.storage {
        StorageBackend::Memory => Arc::new(InMemoryStore::new()),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(PostgresStore::connect(pg).await?)
        }
    };
    tracing::info!(
        backend = store.backend_name(),
        durable = store.is_durable(),
        "store ready"
    );
    let (queue, receiver) = ChannelDeliveryQueue::new(config.delivery_queue_capacity);
    let provider = IdentityProvider::new(
        store,
        Arc::new(queue),
        Arc::new(PrefixTableDetector::new()),
    );
    Ok((
        AppState {
            service_name: SERVICE_NAME.to_string(),
            api_version: "v1".to_string(),
            provider,
        },
        receiver,
    ))
}

/// Stand-in consumer for the external delivery worker: drains handed-off batches so the
/// channel never fills up in a single-process deployment.
async fn log_handoffs(mut receiver: mpsc::Receiver<Vec<DeliveryKey>>) {
    while let Some(batch) = receiver.recv().await {
        for key in &batch {
            tracing::info!(
                client_id = %key.client_id,
                user_id = %key.user_id,
                "pending notification handed off"
            );
        }
    }
}
