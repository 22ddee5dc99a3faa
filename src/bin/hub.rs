use std::sync::Arc;

use clap::Parser;
use homewatch::{
    actions::HostActions,
    actors::{
        messages::MonitorEvent,
        power::PowerHandle,
        storage::StorageHandle,
        supervisor::{Registry, SupervisorHandle},
    },
    alerts::EventReporter,
    config::{StorageConfig, read_config_file},
    storage::{StorageBackend, memory::MemoryBackend},
    ups::NutClient,
    util::get_log_level,
};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let level = get_log_level();
    let filter = filter::Targets::new()
        .with_targets(vec![("homewatch", level), ("homewatch_hub", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

/// Backend, retention and whether the database should be probed
async fn open_storage(
    config: Option<StorageConfig>,
) -> anyhow::Result<(Arc<dyn StorageBackend>, Option<u32>, bool)> {
    match config.unwrap_or_default() {
        StorageConfig::None => {
            info!("storage disabled, keeping records in memory");
            Ok((Arc::new(MemoryBackend::new()), None, false))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite {
            path,
            retention_days,
        } => {
            let backend = homewatch::storage::sqlite::SqliteBackend::new(&path).await?;
            Ok((Arc::new(backend), Some(retention_days), true))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            warn!("built without storage-sqlite, keeping records in memory");
            Ok((Arc::new(MemoryBackend::new()), None, false))
        }
    }
}

#[instrument(skip_all)]
async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(MonitorEvent::ServiceHealth(health)) => {
                trace!(
                    "{} {}: healthy={}",
                    health.kind, health.service_name, health.healthy
                );
            }
            Ok(MonitorEvent::PowerSample(sample)) => {
                trace!(
                    "{}: {:.0}% charge, {}s runtime, flags {:?}",
                    sample.ups_name,
                    sample.battery_charge_percent,
                    sample.battery_runtime_secs,
                    sample.status_flags
                );
            }
            Ok(event) => debug!("{} event", event.topic()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event logger lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();

    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let (backend, retention_days, probe_database) = open_storage(config.storage.clone()).await?;
    debug!("{}", backend.get_stats().await?);

    let storage = StorageHandle::spawn(backend.clone(), retention_days);

    let (events_tx, _) = broadcast::channel(256);
    let reporter = EventReporter::new(Arc::new(storage.clone()), events_tx);
    tokio::spawn(log_events(reporter.subscribe()));

    let registry = Registry::from_config(&config, probe_database.then(|| backend.clone()))?;
    let supervisor = SupervisorHandle::spawn(config.supervisor.clone(), registry, reporter.clone());

    let power = config.power.clone().map(|power| {
        let telemetry = Arc::new(NutClient::new(power.ups.clone(), power.telemetry_timeout()));
        PowerHandle::spawn(power, telemetry, Arc::new(HostActions), reporter.clone())
    });
    if power.is_none() {
        info!("no power section configured, UPS monitoring disabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    supervisor.stop();
    if let Some(power) = &power {
        power.stop();
    }

    storage.flush().await?;
    if let Some(stats) = storage.stats().await {
        info!(
            "storage: {} records written, {} failed, {} deleted by retention",
            stats.records_written, stats.write_failures, stats.records_deleted
        );
    }
    storage.shutdown().await;

    Ok(())
}
