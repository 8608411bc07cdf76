use std::sync::Arc;

use mu_mediator::backend::HttpBackend;
use mu_mediator::core::{MediatorCore, MediatorEvent};
use mu_mediator::stream_store::StreamStore;
use mu_mediator::supervisor::NativeHostSupervisor;
use mu_mediator::{http, socket, BroadcastMessage};
use mu_proto::config::Config;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A tracing layer that forwards warnings and errors to consumers.
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

        // No receivers is fine.
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
    let (log_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = mu_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("mediator.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(log_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,mu_mediator=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Every external input funnels into MediatorCore.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<MediatorEvent>(256);

    let store = StreamStore::new(config.stream.chunk_size, config.stream.safety_ttl());
    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    let supervisor = Arc::new(NativeHostSupervisor::new(&config.supervisor));
    let core = MediatorCore::new(
        config.clone(),
        backend,
        supervisor,
        store.clone(),
        event_tx.clone(),
    );

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        store,
        event_tx.clone(),
        log_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            let _ = shutdown_tx.send(MediatorEvent::Shutdown).await;
        }
    });

    info!("Mediator initialised, running event loop");
    core.run(event_rx).await?;

    Ok(())
}
