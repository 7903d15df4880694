//! Provides helper functions for initializing telemetry collection and publication.
use std::{convert::Infallible, net::SocketAddr};

use anyhow::Result;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use opentelemetry::global;
use opentelemetry_sdk::metrics::MeterProvider as SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

/// Initialize tracing with an env-filtered fmt subscriber.
/// Defaults to INFO if no RUST_LOG env is specified.
pub fn init_tracing() -> Result<()> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(log_filter))
        .init();
    Ok(())
}

/// Initialize metrics collection into a Prometheus registry.
///
/// Sets the global meter provider, counters created via
/// [`opentelemetry::global::meter`] anywhere in the process report into the
/// returned registry. Callers should hold onto the provider and call
/// `shutdown` on it when terminating.
pub fn init_metrics() -> Result<(SdkMeterProvider, Registry)> {
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider.clone());
    Ok((provider, registry))
}

/// Serve the metrics registry over HTTP on /metrics.
pub async fn metrics_server(registry: Registry, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "serving metrics");
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| serve_req(req, registry.clone())))
        }
    });
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

async fn serve_req(req: Request<Body>, registry: Registry) -> Result<Response<Body>, hyper::http::Error> {
    if req.uri().path() != "/metrics" {
        return Response::builder().status(404).body(Body::empty());
    }
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() {
        return Response::builder().status(500).body(Body::empty());
    }
    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buf))
}
