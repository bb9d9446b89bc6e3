//! Gateway server binary: load config, open the store, start the
//! ingresses, supervise sessions until shutdown.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use voxgate::config::{ConfigHandle, GatewayConfig};
use voxgate::metrics::Metrics;
use voxgate::session::SessionSupervisor;
use voxgate::store::ConversationStore;
use voxgate::tts::TtsClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // VOXGATE_LOG_DIR switches logging to a daily-rotated file.
    let _log_guard = match std::env::var_os("VOXGATE_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "voxgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            None
        }
    };

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("voxgate.toml"));
    let config = if config_path.exists() {
        GatewayConfig::load(&config_path).context("loading configuration")?
    } else {
        tracing::info!(path = %config_path.display(), "no config file, using defaults");
        GatewayConfig::default()
    };
    let bind = format!("{}:{}", config.ingress.host, config.ingress.port);
    let store_config = config.store.clone();
    let tts_config = config.tts.clone();
    let handle = ConfigHandle::new(config);

    let store = ConversationStore::open(&store_config)
        .await
        .context("opening conversation store")?;
    let metrics = Metrics::new();
    let tts = TtsClient::new(tts_config);
    let supervisor = SessionSupervisor::new(handle.clone(), store, tts, metrics);

    // SIGHUP re-reads the runtime-tunable subset.
    #[cfg(unix)]
    {
        let handle = handle.clone();
        let path = config_path.clone();
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hup.recv().await.is_some() {
                if let Err(e) = handle.reload(&path) {
                    tracing::warn!(error = %e, "config reload failed");
                }
            }
        });
    }

    let app = voxgate::ingress::ws::router(Arc::clone(&supervisor));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!("voice gateway listening on http://{bind}");

    let serve = axum::serve(listener, app).into_future();
    tokio::select! {
        result = serve => result.context("server error")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            supervisor.shutdown();
        }
    }
    Ok(())
}
