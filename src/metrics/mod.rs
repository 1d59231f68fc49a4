use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::WriteOutcome;
use crate::event_sourcing::store::ReplayReport;

// ============================================================================
// Metrics Module - Prometheus metrics for the event store
// ============================================================================
//
// Covers:
// - Write outcomes per operation (append, delete, index, counter)
// - Rows read per operation and operation latency
// - Statements prepared per query template
// - Replay throughput and failures
//
// The registry is private to the store; callers gather or encode it.
// ============================================================================

pub struct StoreMetrics {
    registry: Registry,

    // Writes
    pub events_appended: IntCounter,
    pub write_outcomes: IntCounterVec,

    // Reads
    pub rows_loaded: IntCounterVec,
    pub operation_duration: HistogramVec,

    // Statements
    pub statements_prepared: IntCounterVec,

    // Replay
    pub replay_events: IntCounter,
    pub replay_streams: IntCounter,
    pub replay_missing_records: IntCounter,
    pub replay_callback_failures: IntCounter,
}

impl StoreMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_appended = IntCounter::new("eventstore_events_appended_total", "Event rows written by appends")?;
        registry.register(Box::new(events_appended.clone()))?;

        let write_outcomes = IntCounterVec::new(
            Opts::new("eventstore_write_outcomes_total", "Write outcomes by operation"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(write_outcomes.clone()))?;

        let rows_loaded = IntCounterVec::new(
            Opts::new("eventstore_rows_loaded_total", "Rows read by operation"),
            &["operation"],
        )?;
        registry.register(Box::new(rows_loaded.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new("eventstore_operation_duration_seconds", "Store operation latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let statements_prepared = IntCounterVec::new(
            Opts::new("eventstore_statements_prepared_total", "Statements prepared per query template"),
            &["template"],
        )?;
        registry.register(Box::new(statements_prepared.clone()))?;

        let replay_events = IntCounter::new("eventstore_replay_events_total", "Events delivered by replays")?;
        registry.register(Box::new(replay_events.clone()))?;

        let replay_streams = IntCounter::new("eventstore_replay_streams_total", "Aggregate streams delivered by replays")?;
        registry.register(Box::new(replay_streams.clone()))?;

        let replay_missing_records = IntCounter::new(
            "eventstore_replay_missing_records_total",
            "Index records whose event row could not be loaded",
        )?;
        registry.register(Box::new(replay_missing_records.clone()))?;

        let replay_callback_failures = IntCounter::new(
            "eventstore_replay_callback_failures_total",
            "Replay callbacks that returned an error or panicked",
        )?;
        registry.register(Box::new(replay_callback_failures.clone()))?;

        Ok(Self {
            registry,
            events_appended,
            write_outcomes,
            rows_loaded,
            operation_duration,
            statements_prepared,
            replay_events,
            replay_streams,
            replay_missing_records,
            replay_callback_failures,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_write(&self, operation: &str, outcome: &WriteOutcome) {
        self.write_outcomes.with_label_values(&[operation, outcome.label()]).inc();
    }

    pub fn record_rows(&self, operation: &str, rows: usize) {
        self.rows_loaded.with_label_values(&[operation]).inc_by(rows as u64);
    }

    pub fn observe_duration(&self, operation: &str, duration_secs: f64) {
        self.operation_duration.with_label_values(&[operation]).observe(duration_secs);
    }

    pub fn record_prepared(&self, template: &str) {
        self.statements_prepared.with_label_values(&[template]).inc();
    }

    pub fn record_replay(&self, report: &ReplayReport) {
        self.replay_events.inc_by(report.events_loaded);
        self.replay_streams.inc_by(report.streams_loaded);
        self.replay_missing_records.inc_by(report.missing_records);
        self.replay_callback_failures.inc_by(report.callback_failures);
    }

    /// Text exposition format, ready to serve or print.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
