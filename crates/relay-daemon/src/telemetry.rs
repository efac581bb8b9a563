//! Tracing bootstrap: console logs always, OTLP span export when sampling
//! is enabled and the exporter comes up. Exporter trouble never blocks the
//! daemon; it degrades to console-only logging with a warning.

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Registry = tracing_subscriber::registry::Registry;

/// Flushes buffered spans on shutdown when an OTLP pipeline was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            // Blocks until the batch exporter has drained; export errors are
            // routed through the exporter's own error handler.
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var("RELAY_OTEL_SAMPLING_RATE").ok().as_deref());

    let (otel_layer, otel_error) = match build_otel_layer(service_name, sampling_rate) {
        Ok(layer) => (layer, None),
        Err(error) => (None, Some(error)),
    };
    let tracer_installed = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = otel_error {
        warn!(%error, "OTLP exporter unavailable; spans stay local");
    }
    info!(service_name, sampling_rate, tracer_installed, "telemetry initialized");

    Ok(TelemetryGuard { tracer_installed })
}

fn build_otel_layer(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<Registry, trace::Tracer>>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let config = trace::Config::default()
        .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]));
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(config)
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .install_batch(Tokio)?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Clamps `RELAY_OTEL_SAMPLING_RATE` into `0.0..=1.0`, defaulting to full
/// sampling. Unparseable values are reported, never fatal.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some("RELAY_OTEL_SAMPLING_RATE is empty; sampling every trace".to_string()),
        );
    }
    match trimmed.parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => (rate, None),
        Ok(rate) => {
            let clamped = rate.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "RELAY_OTEL_SAMPLING_RATE={trimmed} is outside 0.0..=1.0; using {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "RELAY_OTEL_SAMPLING_RATE='{trimmed}' is not a number; sampling every trace"
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_sampling_rate;

    #[test]
    fn sampling_rate_defaults_when_unset() {
        assert_eq!(parse_sampling_rate(None), (1.0, None));
        assert_eq!(parse_sampling_rate(Some("0.5")), (0.5, None));
        assert_eq!(parse_sampling_rate(Some("0")), (0.0, None));
    }

    #[test]
    fn sampling_rate_clamps_out_of_range_values() {
        let (rate, warning) = parse_sampling_rate(Some("2.5"));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("outside 0.0..=1.0"));

        let (rate, warning) = parse_sampling_rate(Some("-0.5"));
        assert_eq!(rate, 0.0);
        assert!(warning.unwrap().contains("using 0"));
    }

    #[test]
    fn sampling_rate_tolerates_garbage_and_blanks() {
        let (rate, warning) = parse_sampling_rate(Some("fast"));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("not a number"));

        let (rate, warning) = parse_sampling_rate(Some("  "));
        assert_eq!(rate, 1.0);
        assert!(warning.unwrap().contains("is empty"));
    }
}
