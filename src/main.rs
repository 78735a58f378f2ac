mod chat;
mod config;
mod history;
mod images;
mod request;
mod response;
mod server;
mod storage;
mod upstream;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use chat::ChatSession;
use config::Config;
use history::HistoryStore;
use storage::SqliteStorage;
use upstream::{HttpTransport, UpstreamClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dalma_relay=info")),
        )
        .init();

    let config = Config::load();

    let storage = SqliteStorage::open(Config::config_dir().join("relay.sqlite"))
        .context("could not open the history database")?;
    let mut history = HistoryStore::new(Box::new(storage));
    history.load();
    if !history.is_empty() {
        tracing::info!(turns = history.len(), "restored chat history");
    }

    let upstream = config.upstream.api_key.as_ref().map(|key| {
        UpstreamClient::new(
            Box::new(HttpTransport::new(
                config.upstream.api_url.clone(),
                key.clone(),
            )),
            config.upstream.max_retries,
            config.upstream.retry_base_delay_ms,
        )
    });
    if upstream.is_none() {
        if config.chat.enable_fallback {
            tracing::warn!("no upstream API key configured, serving fallback replies");
        } else {
            tracing::warn!("no upstream API key configured, /chat will refuse requests");
        }
    }

    let session = ChatSession::new(
        config.request_settings(),
        history,
        upstream,
        config.chat.enable_fallback,
    );
    let app = server::router(Arc::new(Mutex::new(session)));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;
    tracing::info!(%addr, model = %config.upstream.model, "dalma relay listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
