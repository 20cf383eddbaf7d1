//! Observability wiring for the identity service.
//!
//! # Purpose
//! Initializes tracing, OpenTelemetry propagation, and the Prometheus metrics endpoint.
//!
//! # Notes
//! Initialization is guarded by `OnceLock` so tests can call it repeatedly.
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static OBS_INIT: OnceLock<()> = OnceLock::new();
static PROPAGATOR_INIT: OnceLock<()> = OnceLock::new();

/// Default filter when `RUST_LOG` is unset. Pool chatter stays at `warn`.
const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Resource attributes read from the environment, first variable set wins.
const RESOURCE_ENV: &[(&str, &[&str])] = &[
    (
        "service.instance.id",
        &["MASQUE_SERVICE_INSTANCE_ID", "HOSTNAME"],
    ),
    ("deployment.environment", &["DEPLOYMENT_ENVIRONMENT"]),
];

pub fn init_observability(service_name: &str) -> PrometheusHandle {
    OBS_INIT.get_or_init(|| {
        install_propagator();
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true));
        let result = match build_tracer_provider(service_name) {
            Some(provider) => {
                let tracer = provider.tracer(service_name.to_string());
                global::set_tracer_provider(provider);
                registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init()
            }
            None => registry.try_init(),
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    });

    let handle = install_metrics_recorder();
    describe_metrics();
    handle
}

fn install_propagator() {
    PROPAGATOR_INIT.get_or_init(|| {
        global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
    });
}

fn build_tracer_provider(
    service_name: &str,
) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;
    let resource = Resource::builder_empty()
        .with_attributes(resource_attributes(service_name))
        .build();
    Some(
        opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build(),
    )
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    attrs.extend(RESOURCE_ENV.iter().filter_map(|(key, vars)| {
        vars.iter()
            .find_map(|var| std::env::var(var).ok())
            .map(|value| KeyValue::new(*key, value))
    }));
    attrs
}

fn describe_metrics() {
    metrics::describe_counter!(
        "masque_status_transitions_total",
        "User status transitions by target state and outcome (applied, dropped, missing)"
    );
    metrics::describe_counter!(
        "masque_notifications_total",
        "Change notifications appended for delivery, by entity type"
    );
    metrics::describe_counter!(
        "masque_delivery_enqueue_failures_total",
        "Delivery batches the queue refused; their envelopes stay pending"
    );
    metrics::describe_counter!(
        "masque_identity_ensures_total",
        "Identity record upserts, by mode"
    );
    metrics::describe_counter!(
        "masque_authorizations_total",
        "Grant merges through authorization, by kind"
    );
    metrics::describe_counter!(
        "masque_revocations_total",
        "Grants revoked by users"
    );
    metrics::describe_counter!(
        "masque_user_fetches_total",
        "User views served, by data source (real or test)"
    );
    metrics::describe_gauge!(
        "masque_identity_records_total",
        "Identity records held by the in-memory store"
    );
    metrics::describe_gauge!(
        "masque_delivery_queue_depth",
        "Batches waiting in the in-process delivery queue"
    );
}

/// Parent context carried by W3C `traceparent`/`tracestate` request headers.
pub fn trace_context_from_headers(headers: &axum::http::HeaderMap) -> opentelemetry::Context {
    install_propagator();
    global::get_text_map_propagator(|prop| prop.extract(&HeaderMapExtractor(headers)))
}

struct HeaderMapExtractor<'a>(&'a axum::http::HeaderMap);

impl Extractor for HeaderMapExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_metrics_with_listener(handle, listener, std::future::pending()).await
}

async fn serve_metrics_with_listener<F>(
    handle: PrometheusHandle,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

/// Install the global recorder once. If another recorder already owns the global slot,
/// fall back to a detached one so rendering still works.
fn install_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "metrics recorder already installed");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}
