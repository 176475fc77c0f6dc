//! ---
//! lmp_section: "03-observability"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Metrics collection and export utilities."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Registry shared by every component that publishes metrics.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every family in the registry in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metric families")?;
    String::from_utf8(buffer).context("metric text is not valid utf-8")
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new()
        .route("/metrics", get(scrape))
        .with_state(registry);

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener =
        TcpListener::from_std(std_listener).context("failed to adopt metrics listener")?;

    info!(target: "lmp::metrics", address = %bound, "metrics exporter listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics exporter stopped with an error")
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    match encode_text(&registry) {
        Ok(body) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT))],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(target: "lmp::metrics", error = %err, "scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the exporter is bound to (resolved when port 0 was requested).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Process-level metrics of the chaos daemon.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts: IntCounter,
    config_load_seconds: Histogram,
    build_info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts = IntCounter::new("lmp_chaosd_starts_total", "Daemon runs started")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "lmp_chaosd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let build_info = IntGaugeVec::new(
            Opts::new("lmp_chaosd_build_info", "Build of the running daemon; always 1"),
            &["version", "build_timestamp", "target"],
        )?;
        registry.register(Box::new(starts.clone()))?;
        registry.register(Box::new(config_load_seconds.clone()))?;
        registry.register(Box::new(build_info.clone()))?;
        Ok(Self {
            starts,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, build_timestamp: &str, target: &str) {
        self.build_info
            .with_label_values(&[version, build_timestamp, target])
            .set(1);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scrape_serves_text_format_with_its_content_type() {
        let registry = new_registry();
        let daemon = DaemonMetrics::new(&registry).unwrap();
        daemon.inc_start();
        daemon.set_build_info("0.1.0", "2026-01-01T00:00:00Z", "x86_64-unknown-linux-gnu");

        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let response = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
        let body = response.text().await.unwrap();
        assert!(body.contains("lmp_chaosd_starts_total 1"));
        assert!(body.contains("lmp_chaosd_build_info{"));
        assert!(body.contains(r#"version="0.1.0""#));
        server.shutdown().await.unwrap();
    }

    #[test]
    fn encode_text_covers_registered_families() {
        let registry = new_registry();
        let daemon = DaemonMetrics::new(&registry).unwrap();
        daemon.observe_config_load(0.002);
        let text = encode_text(&registry).unwrap();
        assert!(text.contains("lmp_chaosd_config_load_seconds_count 1"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        DaemonMetrics::new(&registry).unwrap();
        assert!(DaemonMetrics::new(&registry).is_err());
    }
}
