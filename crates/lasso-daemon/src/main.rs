mod core;
mod http;
mod socket;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use lasso_core::lastfm::{LastFmClient, ENV_SESSION_KEY};
use lasso_core::{EngineConfig, SessionEngine};
use lasso_proto::config::Config;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Clients only see WARN and ERROR
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!(
            "{} [{}] ",
            chrono::Local::now().format("%H:%M:%S"),
            level
        );
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so the log layer can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let log_path = lasso_proto::platform::log_file();
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,lasso_core=debug,lasso_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let lastfm = Arc::new(LastFmClient::from_config(&config));
    if !lastfm.can_scrobble() {
        warn!(
            "No Last.fm session key or API secret; scrobbles will fail until {} is set",
            ENV_SESSION_KEY
        );
    }

    let engine = Arc::new(SessionEngine::new(
        lastfm.clone(),
        lastfm,
        EngineConfig::from(&config),
    ));

    let _forwarder = core::forward_events(engine.clone(), broadcast_tx.clone());

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        config.daemon.tcp_port,
        engine.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            engine.clone(),
            config.http.allowed_origin.clone(),
        );
    }

    info!("Daemon initialised, waiting for commands");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    engine.shutdown().await;
    Ok(())
}
