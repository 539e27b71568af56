use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_NAME: &str = "voxq";

/// Installs the fmt subscriber, plus a Jaeger exporter when `jaeger_endpoint`
/// is given (e.g. `http://jaeger:14268/api/traces`).
pub fn init(jaeger_endpoint: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let Some(endpoint) = jaeger_endpoint else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::Layer::default())
            .try_init()?;
        return Ok(());
    };

    global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

    let tracer = opentelemetry_jaeger::new_collector_pipeline()
        .with_endpoint(endpoint)
        .with_service_name(SERVICE_NAME)
        .with_isahc()
        .with_timeout(std::time::Duration::from_secs(2))
        .install_batch(opentelemetry::runtime::Tokio)?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}

/// Flushes pending spans. Harmless when no exporter was installed.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jaeger_export_leaves_proxy_settings_alone() {
        std::env::set_var("HTTPS_PROXY", "http://proxy.invalid:3128");

        init(Some("http://127.0.0.1:14268/api/traces")).unwrap();

        assert_eq!(
            std::env::var("HTTPS_PROXY").as_deref(),
            Ok("http://proxy.invalid:3128")
        );
    }
}
