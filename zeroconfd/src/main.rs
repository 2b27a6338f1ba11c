use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use zeroconfd::api;
use zeroconfd::config::{AddressResolution, Config, DEFAULT_CONFIG_PATH};
use zeroconfd::interfaces::SystemInterfaces;
use zeroconfd::manager::{self, BrowserEvent};
use zeroconfd::mdns::daemon::MdnsEngine;
use zeroconfd::mdns::resolve::{AddressStrategy, TokioHostLookup};
use zeroconfd::reactor::NotifyReactor;
use zeroconfd::{Options, Zeroconf};

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?
    } else {
        Config::default()
    };

    // Initialize tracing
    let filter = match &config.log_filter {
        Some(filter) => tracing_subscriber::EnvFilter::new(filter),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("zeroconfd=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting zeroconfd");
    tracing::info!("Using config {}", config_path);

    // Create mDNS daemon, optionally bound to one interface
    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.mdns.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let engine = MdnsEngine::new(mdns_daemon.clone())?;

    let (lookup_tx, lookup_rx) = mpsc::unbounded_channel();
    let address_strategy = match config.discovery.address_resolution {
        AddressResolution::Multicast => AddressStrategy::MulticastQuery,
        AddressResolution::HostLookup => AddressStrategy::HostLookup(Box::new(TokioHostLookup::new(lookup_tx))),
    };

    let core = Zeroconf::new(
        engine,
        NotifyReactor::new(),
        Options {
            dedup: config.discovery.dedup,
            address_strategy,
            max_collision_retries: config.publisher.max_collision_retries,
            interfaces: Box::new(SystemInterfaces),
        },
    );

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn the driver task that owns the core
    let driver = manager::spawn(core, lookup_rx, cancel.clone());
    let zeroconf = driver.handle.clone();

    for service_type in &config.discovery.service_types {
        if let Err(e) = zeroconf.browse(service_type).await {
            tracing::error!("Failed to browse {}: {}", service_type, e);
        }
    }

    for service in &config.publisher.services {
        match zeroconf.register(service.clone()).await {
            Ok(name) => tracing::info!("Published {} as '{}'", service.name, name),
            Err(e) => tracing::error!("Failed to publish {}: {}", service.name, e),
        }
    }

    // Log discovery events
    let mut events = driver.events;
    let events_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BrowserEvent::Added(entry) => tracing::info!(
                    "Discovered {} ({}) at {}:{}",
                    entry.name,
                    entry.service_type,
                    entry.address,
                    entry.port
                ),
                BrowserEvent::Removed(entry) => {
                    tracing::info!("Lost {} ({})", entry.name, entry.service_type)
                }
            }
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        zeroconf: zeroconf.clone(),
        digest_rx: driver.digest,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation; the driver withdraws every registration on exit
    cancel.cancel();
    let _ = tokio::join!(driver.task, server_handle);
    let _ = events_handle.await;

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
