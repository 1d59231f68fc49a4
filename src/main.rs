use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scylla_eventstore::config::StoreSettings;
use scylla_eventstore::metrics::StoreMetrics;
use scylla_eventstore::{
    DomainEvent, EventStore, ReplayOperator, ReplayOptions, ScyllaEventStore, ScyllaIndexStore, StorageManager,
    StoreContext,
};

/// Payloads are never decoded by the bootstrap run; replays work on raw rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
struct OpaqueEvent(serde_json::Value);

impl DomainEvent for OpaqueEvent {
    fn contract_id(&self) -> &'static str {
        "opaque"
    }
}

const USAGE: &str = r#"scylla-eventstore

Creates the keyspace and tables for the configured tenant, then replays the
event store and prints a report.

Usage: scylla-eventstore [OPTIONS]

Options:
  --event-type <ID>   Replay through the type index instead of a full scan
  -h, --help          Show this help

Configuration is read from SCYLLA_NODES and the EVENTSTORE_* variables.
EVENTSTORE_INDEX_EPOCH_MS (oldest indexed event, epoch millis) is required.
"#;

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Option<Option<String>>> {
    let mut event_type = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--event-type" => match args.next() {
                Some(id) => event_type = Some(id),
                None => anyhow::bail!("--event-type requires a value"),
            },
            "--help" | "-h" => return Ok(None),
            other => match other.strip_prefix("--event-type=") {
                Some(id) => event_type = Some(id.to_string()),
                None => anyhow::bail!("unknown argument '{}'\n\n{}", other, USAGE),
            },
        }
    }
    Ok(Some(event_type))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter, e.g. RUST_LOG=debug
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,scylla_eventstore=debug")))
        .init();

    let Some(event_type) = parse_args(std::env::args().skip(1))? else {
        println!("{}", USAGE);
        return Ok(());
    };

    let settings = StoreSettings::from_env()?;
    tracing::info!(
        nodes = ?settings.known_nodes,
        tenant = %settings.tenant,
        keyspace = %settings.keyspace,
        bounded_context = %settings.bounded_context,
        table_mode = ?settings.table_mode,
        "Starting event store bootstrap"
    );

    // === 1. Storage ===
    let metrics = Arc::new(StoreMetrics::new()?);
    let context = StoreContext::from_settings(&settings, metrics.clone())?;
    let index = Arc::new(ScyllaIndexStore::from_settings(context.clone(), &settings)?);

    let storage = StorageManager::new(context.clone());
    storage.create_keyspace(settings.replication_factor).await?;
    storage.create_storage().await?;

    // === 2. Stores ===
    let store = ScyllaEventStore::<OpaqueEvent>::new(context, index);

    // === 3. Replay ===
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping replay after in-flight callbacks");
            on_signal.cancel();
        }
    });

    let bytes_seen = Arc::new(AtomicU64::new(0));
    let counter = bytes_seen.clone();
    let operator = ReplayOperator::new()
        .on_load(move |raw| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(raw.data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
        })
        .on_aggregate_stream_loaded(|stream| async move {
            tracing::debug!(aggregate_id = %stream.aggregate_id, events = stream.events.len(), "Aggregate replayed");
            Ok(())
        })
        .notify_progress(|options| async move {
            let token = options.pagination_token.map(|t| String::from_utf8_lossy(&t).into_owned());
            tracing::info!(token = ?token, "Replay progress");
            Ok(())
        })
        .on_finish(|| async {
            tracing::info!("Replay finished");
            Ok(())
        });

    let options = match event_type {
        Some(event_type) => ReplayOptions::for_event_type(event_type),
        None => ReplayOptions::default(),
    }
    .with_batch_size(settings.batch_size)
    .with_parallelism(settings.max_degree_of_parallelism);

    let report = store.enumerate_event_store(&operator, options, &cancel).await?;

    println!("{:#?}", report);
    println!("payload bytes: {}", bytes_seen.load(Ordering::Relaxed));
    tracing::debug!(metrics = %metrics.encode()?, "Final metrics");
    Ok(())
}
