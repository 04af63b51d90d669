mod auth;
mod core;
mod dispatch;
mod http;
mod probe;
mod settle;
mod watch;

use clap::Parser;
use mixify_proto::config::Config;
use mixify_proto::protocol::WatchCommand;
use mixify_proto::state::StatusBoard;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Reports the track loaded in Serato to a Mixify event.
#[derive(Debug, Parser)]
#[command(name = "mixify-companion", version)]
struct Args {
    /// Start watching this event immediately.
    #[arg(long)]
    event: Option<String>,
    /// Do not start the local control API.
    #[arg(long)]
    no_http: bool,
}

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    Log(String),
}

/// Tracing layer forwarding warnings and errors to the broadcast channel.
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
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
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
    let args = Args::parse();

    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let log_path = mixify_proto::platform::log_file();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,mixify_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    if config.dispatch.api_key.is_empty() {
        warn!("dispatch.api_key is empty; the endpoint will likely reject updates");
    }

    let board = StatusBoard::new();
    let _log_forwarder = core::spawn_log_forwarder(broadcast_tx.subscribe(), board.clone());

    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::CoreEvent>(256);

    let credentials = auth::SessionFileProvider::new(config.auth.session_file.clone());
    let dispatcher = dispatch::DispatchClient::new(&config.dispatch, credentials)?;
    let probe = probe::SeratoLogProbe::new(&config.probe);
    info!("Watching Serato logs in {:?}", config.probe.logs_dir);

    let companion = core::CompanionCore::new(
        &config.watch,
        probe,
        dispatcher,
        board.clone(),
        event_tx.clone(),
    );

    if config.http.enabled && !args.no_http {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            board.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(core::CoreEvent::Shutdown).await;
        }
    });

    if let Some(event_id) = args.event {
        event_tx
            .send(core::CoreEvent::Command(WatchCommand::Start { event_id }))
            .await?;
    }

    info!("Companion initialised, running event loop");
    companion.run(event_rx).await?;

    Ok(())
}
