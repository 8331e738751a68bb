use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: env-filtered fmt output, plus OTLP span export when an
/// endpoint is configured. Later calls are no-ops.
pub fn init_tracing(service_name: &'static str) {
    #[cfg(feature = "distributed")]
    let exporter_error = match std::env::var(OTLP_ENDPOINT_VAR) {
        Ok(endpoint) => match otlp::layer(service_name, &endpoint) {
            Ok(otel_layer) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter())
                    .with(otel_layer)
                    .with(tracing_subscriber::fmt::layer())
                    .try_init();
                return;
            }
            Err(e) => Some(format!("{}: {}", endpoint, e)),
        },
        Err(_) => None,
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    #[cfg(feature = "distributed")]
    if let Some(e) = exporter_error {
        tracing::warn!(service = service_name, error = %e, "unable to build OTLP exporter, logging locally only");
    }
    tracing::debug!(service = service_name, "tracing initialised");
}

#[cfg(feature = "distributed")]
mod otlp {
    use opentelemetry::KeyValue;
    use opentelemetry::trace::TracerProvider;
    use opentelemetry_otlp::{Protocol, WithExportConfig};
    use opentelemetry_sdk::{Resource, trace as sdktrace};
    use tracing_subscriber::Layer;
    use tracing_subscriber::registry::LookupSpan;

    pub fn layer<S>(service_name: &'static str, endpoint: &str) -> Result<impl Layer<S>, String>
    where
        S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{}/v1/traces", endpoint.trim_end_matches('/')))
            .build()
            .map_err(|e| e.to_string())?;
        let resource = Resource::builder_empty()
            .with_attributes(vec![KeyValue::new("service.name", service_name)])
            .build();
        let tracer_provider = sdktrace::SdkTracerProvider::builder()
            .with_simple_exporter(exporter)
            .with_resource(resource)
            .build();
        let tracer = tracer_provider.tracer(service_name);
        Ok(tracing_opentelemetry::layer().with_tracer(tracer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing("webreduce-test");
        init_tracing("webreduce-test");
        tracing::info!("still logging");
    }
}
