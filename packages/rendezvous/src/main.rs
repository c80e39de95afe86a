use clap::Parser;
use opentelemetry::global;
use rendezvous::{args::CliArgs, config::Config, config::ConfigBuilder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::{
    context::AppContext,
    telemetry::{init_metrics_export, init_tracing_export, Metrics},
};

fn main() {
    let args = CliArgs::parse();
    let config: Config = match ConfigBuilder::new(args).build() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("bad config: {err:#}");
            std::process::exit(1);
        }
    };

    let ctx = AppContext::new();

    // setup tracing
    let filters = config.tracing_env_filter().unwrap();
    let tracer_provider = if let Some(collector) = config.jaeger.as_ref() {
        Some(init_tracing_export(collector, &config.replica_id, filters))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_target(false),
            )
            .with(filters)
            .try_init()
            .unwrap();
        None
    };

    let meter_provider = config
        .prometheus
        .as_ref()
        .map(|collector| init_metrics_export(collector, &config.replica_id));
    let meter = global::meter("rendezvous_metrics");
    let metrics = Metrics::init(&meter);

    if !config.consistency_checks {
        tracing::warn!("CONSISTENCY_CHECKS=0: the engine runs as a no-op");
    }

    rendezvous::run_server(ctx, config, metrics);

    if let Some(tracer) = tracer_provider {
        if tracer.shutdown().is_err() {
            //eprintln!("TracerProvider didn't shutdown cleanly: {e:?}")
        }
    }
    if let Some(meter) = meter_provider {
        if meter.shutdown().is_err() {
            //eprintln!("MeterProvider didn't shutdown cleanly: {e:?}")
        }
    }
}
