use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    resource::Resource,
    trace::{BatchSpanProcessor, Sampler, SdkTracerProvider},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Every replica exports under its own service name so traces from a fleet
/// stay distinguishable at the collector.
fn replica_resource(replica_id: &str) -> Resource {
    Resource::builder()
        .with_service_name(format!("rendezvous-{replica_id}"))
        .build()
}

/// Install the OTLP trace pipeline and the tracing subscriber on top of
/// it. Incoming requests arrive from already-traced client services, so
/// sampling follows the caller's decision (parent-based) instead of
/// sampling unconditionally. Returns the provider so main can flush it on
/// shutdown.
pub fn init_tracing_export(
    collector: &str,
    replica_id: &str,
    filters: tracing_subscriber::EnvFilter,
) -> SdkTracerProvider {
    global::set_text_map_propagator(opentelemetry_jaeger_propagator::Propagator::new());

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(format!("{collector}/v1/traces"))
        .build()
        .expect("failed to build OTLP span exporter");

    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_resource(replica_resource(replica_id))
        .build();
    global::set_tracer_provider(provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("rendezvous"));
    tracing_subscriber::registry()
        .with(filters)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    tracing::info!("trace export enabled to {}", collector);
    provider
}

/// Install the OTLP metric pipeline. Returns the provider so main can
/// flush it on shutdown.
pub fn init_metrics_export(collector: &str, replica_id: &str) -> SdkMeterProvider {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{collector}/v1/metrics"))
        .build()
        .expect("failed to build OTLP metric exporter");

    let provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(replica_resource(replica_id))
        .build();
    global::set_meter_provider(provider.clone());

    tracing::info!("metric export enabled to {}", collector);
    provider
}

use opentelemetry::metrics::{Counter, Meter, UpDownCounter};

pub struct Metrics {
    pub http: HttpMetrics,
    pub server: ServerMetrics,
    pub replication: ReplicationMetrics,
}

impl Metrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            http: HttpMetrics::init(meter),
            server: ServerMetrics::init(meter),
            replication: ReplicationMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    pub active_subscribers: UpDownCounter<i64>,
}

impl HttpMetrics {
    pub const LABEL: &'static str = "http";

    pub fn init(meter: &Meter) -> Self {
        HttpMetrics {
            active_subscribers: meter
                .i64_up_down_counter(format!("{}_active_subscribers", Self::LABEL))
                .with_description("Number of subscriber streams currently connected")
                .build(),
        }
    }

    pub fn increment_active_subscribers(&self) {
        self.active_subscribers.add(1, &[]);
    }

    pub fn decrement_active_subscribers(&self) {
        self.active_subscribers.add(-1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct ServerMetrics {
    pub registered_requests: Counter<u64>,
    pub registered_branches: Counter<u64>,
    pub closed_branches: Counter<u64>,
    pub prevented_inconsistencies: Counter<u64>,
}

impl ServerMetrics {
    pub const LABEL: &'static str = "server";

    pub fn init(meter: &Meter) -> Self {
        Self {
            registered_requests: meter
                .u64_counter(format!("{}_registered_requests", Self::LABEL))
                .with_description("Total number of requests registered")
                .build(),
            registered_branches: meter
                .u64_counter(format!("{}_registered_branches", Self::LABEL))
                .with_description("Total number of branches registered")
                .build(),
            closed_branches: meter
                .u64_counter(format!("{}_closed_branches", Self::LABEL))
                .with_description("Total number of branch regions closed")
                .build(),
            prevented_inconsistencies: meter
                .u64_counter(format!("{}_prevented_inconsistencies", Self::LABEL))
                .with_description("Wait calls that blocked at least once before succeeding")
                .build(),
        }
    }

    pub fn increment_registered_requests(&self) {
        self.registered_requests.add(1, &[]);
    }

    pub fn increment_registered_branches(&self) {
        self.registered_branches.add(1, &[]);
    }

    pub fn increment_closed_branches(&self) {
        self.closed_branches.add(1, &[]);
    }

    pub fn increment_prevented_inconsistencies(&self) {
        self.prevented_inconsistencies.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct ReplicationMetrics {
    pub total_errors: Counter<u64>,
}

impl ReplicationMetrics {
    pub const LABEL: &'static str = "replication";

    pub fn init(meter: &Meter) -> Self {
        Self {
            total_errors: meter
                .u64_counter(format!("{}_total_errors", Self::LABEL))
                .with_description("Total number of errors while fanning out to peers")
                .build(),
        }
    }

    pub fn increment_total_errors(&self) {
        self.total_errors.add(1, &[]);
    }
}
