//! Tracing bootstrap for the daemon.
//!
//! Console logging is always installed. When an OTLP endpoint is
//! configured, spans additionally export through the OTLP pipeline,
//! sampled at `FLUX_OTEL_SAMPLING_RATE`. Exporter failures degrade to
//! console-only logging instead of failing startup, so a missing collector
//! never keeps the RPC engine from serving.

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Flushes the span exporter when the daemon winds down.
#[derive(Debug)]
pub struct TelemetryGuard {
    flush_on_drop: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.flush_on_drop {
            global::shutdown_tracer_provider();
        }
    }
}

/// Exporter settings resolved from the environment. The endpoint comes
/// from `FLUX_OTEL_ENDPOINT` (or the standard `OTEL_EXPORTER_OTLP_ENDPOINT`);
/// no endpoint means console logging only.
#[derive(Debug, Clone)]
struct ExporterSettings {
    endpoint: Option<String>,
    sampling_rate: f64,
}

impl ExporterSettings {
    fn from_env() -> (Self, Option<String>) {
        let endpoint = env::var("FLUX_OTEL_ENDPOINT")
            .or_else(|_| env::var("OTEL_EXPORTER_OTLP_ENDPOINT"))
            .ok()
            .filter(|value| !value.trim().is_empty());

        let (sampling_rate, problem) = match env::var("FLUX_OTEL_SAMPLING_RATE") {
            Err(_) => (1.0, None),
            Ok(raw) => match parse_sampling_rate(&raw) {
                Ok(rate) => (rate, None),
                Err(problem) => (1.0, Some(problem)),
            },
        };

        (
            Self {
                endpoint,
                sampling_rate,
            },
            problem,
        )
    }
}

/// Parses `FLUX_OTEL_SAMPLING_RATE`. Anything that is not a float inside
/// `0.0..=1.0` is rejected; the caller falls back to sampling everything.
fn parse_sampling_rate(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("FLUX_OTEL_SAMPLING_RATE is set but empty".to_string());
    }
    match trimmed.parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => Ok(rate),
        Ok(rate) => Err(format!(
            "FLUX_OTEL_SAMPLING_RATE {rate} is outside 0.0..=1.0"
        )),
        Err(_) => Err(format!(
            "FLUX_OTEL_SAMPLING_RATE '{trimmed}' is not a number"
        )),
    }
}

/// Installs the tracing subscriber and, when configured, the OTLP span
/// pipeline. Spans carry the `namespace`/`procedure` fields recorded by the
/// executor's instrumentation, so exported traces group by procedure.
pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let (settings, rate_problem) = ExporterSettings::from_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = TelemetryGuard {
        flush_on_drop: false,
    };
    let mut exporter_error: Option<anyhow::Error> = None;

    match build_tracer(service_name, &settings) {
        Ok(Some(tracer)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
            guard.flush_on_drop = true;
        }
        Ok(None) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        Err(error) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            exporter_error = Some(error);
        }
    }

    if let Some(problem) = rate_problem {
        warn!("{problem}; sampling every span");
    }
    if let Some(error) = exporter_error {
        warn!(%error, "span exporter unavailable; continuing with console logs only");
    }
    info!(
        sampling_rate = settings.sampling_rate,
        exporter = settings.endpoint.as_deref().unwrap_or("disabled"),
        "telemetry ready"
    );

    Ok(guard)
}

fn build_tracer(
    service_name: &str,
    settings: &ExporterSettings,
) -> Result<Option<trace::Tracer>> {
    let Some(endpoint) = settings.endpoint.as_deref() else {
        return Ok(None);
    };
    if settings.sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint.to_string());
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(settings.sampling_rate))
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracer))
}
