//! Logging and optional OpenTelemetry trace export.
//!
//! Log lines always go to standard error through the `tracing-subscriber` fmt layer, filtered by
//! `RUST_LOG` (default `info`). OTLP export is **disabled by default** and is switched on with
//! `enable_otel_export: true`; the exporter is then configured from the standard environment
//! variables:
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - The OTLP endpoint URL (default `http://localhost:4318`)
//! - `OTEL_EXPORTER_OTLP_PROTOCOL` - `http/protobuf` (default) or `http/json`
//! - `OTEL_EXPORTER_OTLP_HEADERS` - Comma-separated `key=value` pairs, `%20` decodes to a space
//! - `OTEL_SERVICE_NAME` - Service name for resource identification (default `regctl`)
//!
//! The SDK tracer provider is kept in a `OnceLock` so [`shutdown_telemetry`] can flush pending
//! spans before exit; `tracing-opentelemetry` only holds a tracer, not the provider.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

const DEFAULT_SERVICE_NAME: &str = "regctl";
const DEFAULT_ENDPOINT: &str = "http://localhost:4318";

/// Exporter settings read from the `OTEL_*` environment variables
#[derive(Debug, Clone, PartialEq)]
struct OtlpSettings {
    service_name: String,
    endpoint: String,
    protocol: Protocol,
    headers: HashMap<String, String>,
}

impl OtlpSettings {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_vars(
            var("OTEL_SERVICE_NAME"),
            var("OTEL_EXPORTER_OTLP_ENDPOINT"),
            var("OTEL_EXPORTER_OTLP_PROTOCOL"),
            var("OTEL_EXPORTER_OTLP_HEADERS"),
        )
    }

    fn from_vars(service_name: Option<String>, endpoint: Option<String>, protocol: Option<String>, headers: Option<String>) -> Self {
        let protocol = match protocol.as_deref() {
            Some("http/json") => Protocol::HttpJson,
            _ => Protocol::HttpBinary,
        };
        Self {
            service_name: service_name.unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            protocol,
            headers: headers.as_deref().map(parse_headers).unwrap_or_default(),
        }
    }
}

fn parse_headers(raw: &str) -> HashMap<String, String> {
    raw.replace("%20", " ")
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Install the global subscriber: stderr fmt layer, plus OTLP export when requested.
///
/// If the exporter cannot be built, logging still starts and the failure is reported once.
pub fn init_telemetry(enable_otel_export: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (otel_layer, status) = if enable_otel_export {
        match create_otlp_tracer(OtlpSettings::from_env()) {
            Ok(tracer) => (
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                "OTLP export enabled".to_string(),
            ),
            Err(e) => (None, format!("OTLP export unavailable: {e}")),
        }
    } else {
        (None, "OTLP export disabled".to_string())
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    info!("Telemetry initialized ({status})");
    Ok(())
}

fn create_otlp_tracer(settings: OtlpSettings) -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    // The subscriber is not installed yet
    eprintln!(
        "[OTLP] service={} endpoint={} headers={}",
        settings.service_name,
        settings.endpoint,
        settings.headers.len()
    );

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(&settings.endpoint)
        .with_protocol(settings.protocol)
        .with_headers(settings.headers)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_attribute(KeyValue::new("service.name", settings.service_name.clone()))
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(settings.service_name);
    let _ = TRACER_PROVIDER.set(tracer_provider);

    Ok(tracer)
}

/// Flush and shut down the tracer provider, if one was installed
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        tracing::error!("Failed to shutdown tracer provider: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = OtlpSettings::from_vars(None, None, None, None);
        assert_eq!(settings.service_name, "regctl");
        assert_eq!(settings.endpoint, "http://localhost:4318");
        assert_eq!(settings.protocol, Protocol::HttpBinary);
        assert!(settings.headers.is_empty());
    }

    #[test]
    fn test_headers_are_decoded() {
        let settings = OtlpSettings::from_vars(
            Some("registry".to_string()),
            None,
            Some("http/json".to_string()),
            Some("Authorization=Basic%20abc, X-Scope = tenant,broken".to_string()),
        );
        assert_eq!(settings.protocol, Protocol::HttpJson);
        assert_eq!(settings.headers.len(), 2);
        assert_eq!(settings.headers["Authorization"], "Basic abc");
        assert_eq!(settings.headers["X-Scope"], "tenant");
    }
}
