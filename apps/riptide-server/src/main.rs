use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusHandle;
use riptide::{
    adapters::http::{router, HttpOptions},
    Bridge, BridgeConfig,
};
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

mod demos;
mod telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Demo {
    /// A running stopwatch driven from the backend's main loop.
    Clock,
    /// A click counter driven by browser calls.
    Counter,
}

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    demo: Demo,
    cookies: bool,
    log_filter: String,
    bridge: BridgeConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "riptide-server",
    author,
    version,
    about = "Serves a riptide demo app over HTTP"
)]
struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "RIPTIDE_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: String,

    /// Which demo application to serve.
    #[arg(long, env = "RIPTIDE_DEMO", value_enum, default_value_t = Demo::Clock)]
    demo: Demo,

    /// Share one session between all browsers instead of tracking them by cookie.
    #[arg(long, env = "RIPTIDE_NO_COOKIES", default_value_t = false)]
    no_cookies: bool,

    /// Tracing filter used when RUST_LOG is unset.
    #[arg(long, env = "RIPTIDE_LOG", default_value = "info,riptide=debug")]
    log_filter: String,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            demo: cli.demo,
            cookies: !cli.no_cookies,
            log_filter: cli.log_filter,
            bridge: BridgeConfig::from_env(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let telemetry = telemetry::Telemetry::init(&config.log_filter)?;
    info!(
        listen_addr = %config.listen_addr,
        demo = ?config.demo,
        cookies = config.cookies,
        "starting riptide server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let factory = match config.demo {
        Demo::Clock => demos::clock::factory(),
        Demo::Counter => demos::counter::factory(),
    };
    let bridge = Bridge::new(factory, config.bridge.clone());
    bridge.spawn_sweeper();

    let ops = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let app = router(
        bridge,
        HttpOptions {
            cookies: config.cookies,
        },
    )
    .merge(ops)
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("riptide listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}
