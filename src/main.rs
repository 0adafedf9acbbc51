use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotbook::availability::AvailabilityStore;
use slotbook::booking::BookingService;
use slotbook::catalog::MeetingCatalog;
use slotbook::config::Settings;
use slotbook::store::WalStore;
use slotbook::{reaper, wire};

const BACKFILL_EVERY: Duration = Duration::from_secs(3600);
const COMPACT_CHECK_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    slotbook::observability::init(settings.metrics_port);

    let policy = Arc::new(settings.load_policy()?);
    std::fs::create_dir_all(&settings.data_dir)?;
    let store = Arc::new(WalStore::open(&settings.data_dir.join("meetings.wal"))?);

    let slots = Arc::new(AvailabilityStore::new(policy.clone()));
    let service = Arc::new(BookingService::new(
        slots,
        store.clone(),
        MeetingCatalog::default(),
        settings.booking.clone(),
    ));

    // Holds live in memory only: rebuild them from the stored meetings before serving.
    let generated = service.backfill()?;
    let report = service.reconcile(Duration::ZERO).await?;
    info!(
        "startup: {generated} day(s) generated, {} hold(s) restored, {} conflict(s)",
        report.restored, report.conflicts
    );

    tokio::spawn(reaper::run_reconciler(
        service.clone(),
        settings.reconcile_interval,
        settings.hold_grace,
    ));
    tokio::spawn(reaper::run_backfill(service.clone(), BACKFILL_EVERY));
    tokio::spawn(reaper::run_compactor(
        store.clone(),
        settings.compact_threshold,
        COMPACT_CHECK_EVERY,
    ));

    let max_connections = settings.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  timezone: {}", policy.timezone);
    info!("  booking window: {} days", settings.booking.window_days);
    info!("  max_connections: {max_connections}");
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(slotbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                tracing::debug!("connection from {peer}");
                metrics::counter!(slotbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let service = service.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, service).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotbook stopped");
    Ok(())
}
