use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event_sourcing::core::{AggregateId, AggregateStream, Order, PagingState, RawEvent};
use super::{IndexReadOptions, ReplaySource};

// ============================================================================
// Replay Protocol - Full-Store and Indexed Enumeration
// ============================================================================
//
// Two modes, picked by `ReplayOptions::event_type_id`:
//
// - Full scan: page the events table in storage order, keep rows inside the
//   time window, group consecutive rows of the same aggregate into streams.
// - Index scan: page the type index and resolve each record with a point
//   lookup.
//
// Callbacks run on the tokio scheduler. Each channel keeps at most
// `max_degree_of_parallelism` tasks in flight; when full, the scan waits for
// any one of them before admitting more. A failing callback is logged and
// counted, it never stops the scan.
//
// ============================================================================

pub type CallbackResult = anyhow::Result<()>;

type LoadCallback = Arc<dyn Fn(RawEvent) -> BoxFuture<'static, CallbackResult> + Send + Sync>;
type StreamCallback = Arc<dyn Fn(AggregateStream) -> BoxFuture<'static, CallbackResult> + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(ReplayOptions) -> BoxFuture<'static, CallbackResult> + Send + Sync>;
type FinishCallback = Arc<dyn Fn() -> BoxFuture<'static, CallbackResult> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayOptions {
    /// `None` replays the whole store, `Some` walks the type index.
    pub event_type_id: Option<String>,
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub batch_size: i32,
    pub max_degree_of_parallelism: usize,
    /// Serialized `PagingState` to resume from.
    pub pagination_token: Option<Vec<u8>>,
    pub order: Order,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            event_type_id: None,
            after: None,
            before: None,
            batch_size: 1000,
            max_degree_of_parallelism: 2,
            pagination_token: None,
            order: Order::Ascending,
        }
    }
}

impl ReplayOptions {
    pub fn for_event_type(event_type_id: impl Into<String>) -> Self {
        Self {
            event_type_id: Some(event_type_id.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, after: Option<i64>, before: Option<i64>) -> Self {
        self.after = after;
        self.before = before;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_parallelism(mut self, max_degree_of_parallelism: usize) -> Self {
        self.max_degree_of_parallelism = max_degree_of_parallelism;
        self
    }

    pub fn with_pagination_token(mut self, token: Option<Vec<u8>>) -> Self {
        self.pagination_token = token;
        self
    }

    /// Inclusive time-window check (`after <= ts <= before`).
    pub fn contains(&self, timestamp: i64) -> bool {
        self.after.map_or(true, |after| timestamp >= after)
            && self.before.map_or(true, |before| timestamp <= before)
    }
}

// ============================================================================
// Operator - the callbacks a replay drives
// ============================================================================

/// Callbacks invoked by a replay. Every channel is optional.
#[derive(Clone, Default)]
pub struct ReplayOperator {
    on_load: Option<LoadCallback>,
    on_aggregate_stream_loaded: Option<StreamCallback>,
    notify_progress: Option<ProgressCallback>,
    on_finish: Option<FinishCallback>,
}

impl ReplayOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_load<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(RawEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.on_load = Some(Arc::new(move |raw| callback(raw).boxed()));
        self
    }

    pub fn on_aggregate_stream_loaded<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(AggregateStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.on_aggregate_stream_loaded = Some(Arc::new(move |stream| callback(stream).boxed()));
        self
    }

    /// Called whenever the cursor advances, with the options carrying the
    /// new pagination token. Persist them to resume after a crash.
    pub fn notify_progress<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(ReplayOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.notify_progress = Some(Arc::new(move |options| callback(options).boxed()));
        self
    }

    pub fn on_finish<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.on_finish = Some(Arc::new(move || callback().boxed()));
        self
    }
}

/// Summary of one enumeration run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub pages: u64,
    pub events_loaded: u64,
    pub streams_loaded: u64,
    /// Index records whose event row could not be found.
    pub missing_records: u64,
    pub callback_failures: u64,
    pub cancelled: bool,
    pub finished: bool,
}

// ============================================================================
// Bounded in-flight task set
// ============================================================================

struct InFlight {
    channel: &'static str,
    limit: usize,
    tasks: JoinSet<(String, std::result::Result<CallbackResult, String>)>,
    failures: u64,
}

impl InFlight {
    fn new(channel: &'static str, limit: usize) -> Self {
        Self {
            channel,
            limit: limit.max(1),
            tasks: JoinSet::new(),
            failures: 0,
        }
    }

    async fn admit(&mut self, identity: String, task: BoxFuture<'static, CallbackResult>) {
        while self.tasks.len() >= self.limit {
            self.settle_one().await;
        }

        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(panic.as_ref()));
            (identity, outcome)
        });
    }

    async fn settle_one(&mut self) {
        let Some(joined) = self.tasks.join_next().await else {
            return;
        };

        match joined {
            Ok((_, Ok(Ok(())))) => {}
            Ok((identity, Ok(Err(error)))) => {
                self.failures += 1;
                tracing::error!(
                    channel = self.channel,
                    record = %identity,
                    error = %error,
                    "Replay callback failed"
                );
            }
            Ok((identity, Err(panic))) => {
                self.failures += 1;
                tracing::error!(
                    channel = self.channel,
                    record = %identity,
                    panic = %panic,
                    "Replay callback panicked"
                );
            }
            Err(join_error) => {
                self.failures += 1;
                tracing::error!(
                    channel = self.channel,
                    error = %join_error,
                    "Replay callback task was aborted"
                );
            }
        }
    }

    async fn drain(&mut self) {
        while !self.tasks.is_empty() {
            self.settle_one().await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn identity(raw: &RawEvent) -> String {
    format!("{}@{}:{}", raw.aggregate_id, raw.revision, raw.position)
}

// ============================================================================
// Aggregate grouping
// ============================================================================

/// How many recently emitted aggregate ids the grouper remembers.
pub const RECENT_AGGREGATES: usize = 256;

/// Groups a partition-contiguous row sequence into per-aggregate streams.
///
/// Backends feeding a full scan must deliver all rows of one aggregate next
/// to each other. An aggregate that shows up again shortly after its stream
/// was emitted breaks that contract and is reported. Only the last
/// [`RECENT_AGGREGATES`] ids are checked, so memory stays flat over a
/// full-store replay.
#[derive(Default)]
pub struct AggregateGrouper {
    current: Option<AggregateStream>,
    recent: VecDeque<AggregateId>,
    violations: u64,
}

impl AggregateGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row; returns the previous aggregate's stream when the id changes.
    pub fn push(&mut self, raw: RawEvent) -> Option<AggregateStream> {
        if let Some(stream) = self.current.as_mut() {
            if stream.aggregate_id == raw.aggregate_id {
                stream.events.push(raw);
                return None;
            }
        }

        if self.recent.contains(&raw.aggregate_id) {
            self.violations += 1;
            tracing::warn!(
                aggregate_id = %raw.aggregate_id,
                "Aggregate rows are not contiguous in the scan; stream will be emitted more than once"
            );
        }

        let next = AggregateStream {
            aggregate_id: raw.aggregate_id,
            events: vec![raw],
        };
        let finished = self.current.replace(next);
        finished.map(|stream| self.mark_emitted(stream))
    }

    /// Flush the last open stream.
    pub fn finish(&mut self) -> Option<AggregateStream> {
        let finished = self.current.take();
        finished.map(|stream| self.mark_emitted(stream))
    }

    /// Aggregates seen again after their stream was emitted.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    fn mark_emitted(&mut self, stream: AggregateStream) -> AggregateStream {
        if self.recent.len() == RECENT_AGGREGATES {
            self.recent.pop_front();
        }
        self.recent.push_back(stream.aggregate_id);
        stream
    }
}

// ============================================================================
// Enumeration
// ============================================================================

struct Channels<'a> {
    operator: &'a ReplayOperator,
    loads: InFlight,
    streams: InFlight,
}

impl Channels<'_> {
    async fn load(&mut self, raw: &RawEvent) {
        if let Some(on_load) = &self.operator.on_load {
            self.loads.admit(identity(raw), on_load(raw.clone())).await;
        }
    }

    async fn stream(&mut self, stream: AggregateStream) {
        if let Some(on_stream) = &self.operator.on_aggregate_stream_loaded {
            let identity = stream.aggregate_id.to_string();
            self.streams.admit(identity, on_stream(stream)).await;
        }
    }

    async fn progress(&self, options: &ReplayOptions) {
        if let Some(notify) = &self.operator.notify_progress {
            if let Err(error) = notify(options.clone()).await {
                tracing::warn!(error = %error, "Replay progress notification failed");
            }
        }
    }
}

/// Run a replay against `source`.
///
/// In-flight callbacks are always awaited before returning. `on_finish` runs
/// once, and only when the source was exhausted (not on cancellation or a
/// storage error).
pub async fn enumerate<S>(
    source: &S,
    operator: &ReplayOperator,
    mut options: ReplayOptions,
    cancel: &CancellationToken,
) -> Result<ReplayReport>
where
    S: ReplaySource + ?Sized,
{
    let paging = PagingState::resume(options.pagination_token.as_deref())?;
    let mut channels = Channels {
        operator,
        loads: InFlight::new("on_load", options.max_degree_of_parallelism),
        streams: InFlight::new("on_aggregate_stream_loaded", options.max_degree_of_parallelism),
    };
    let mut report = ReplayReport::default();

    tracing::info!(
        event_type = options.event_type_id.as_deref().unwrap_or("*"),
        batch_size = options.batch_size,
        max_degree_of_parallelism = options.max_degree_of_parallelism,
        resumed = options.pagination_token.is_some(),
        "Starting event store replay"
    );

    let scanned = match options.event_type_id.clone() {
        None => full_scan(source, &mut channels, &mut options, paging, cancel, &mut report).await,
        Some(event_type_id) => {
            index_scan(source, &mut channels, &mut options, &event_type_id, paging, cancel, &mut report).await
        }
    };

    channels.loads.drain().await;
    channels.streams.drain().await;
    report.callback_failures = channels.loads.failures + channels.streams.failures;

    scanned?;

    if !report.cancelled {
        if let Some(on_finish) = &operator.on_finish {
            if let Err(error) = on_finish().await {
                report.callback_failures += 1;
                tracing::error!(error = %error, "Replay on_finish callback failed");
            }
        }
        report.finished = true;
    }

    tracing::info!(
        pages = report.pages,
        events = report.events_loaded,
        streams = report.streams_loaded,
        missing = report.missing_records,
        failures = report.callback_failures,
        cancelled = report.cancelled,
        "Event store replay completed"
    );

    Ok(report)
}

async fn full_scan<S>(
    source: &S,
    channels: &mut Channels<'_>,
    options: &mut ReplayOptions,
    mut paging: PagingState,
    cancel: &CancellationToken,
    report: &mut ReplayReport,
) -> Result<()>
where
    S: ReplaySource + ?Sized,
{
    let mut grouper = AggregateGrouper::new();
    let group = channels.operator.on_aggregate_stream_loaded.is_some();

    while paging.has_more() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let page = source.scan_page(&paging, options.batch_size).await?;
        report.pages += 1;

        for raw in page.items {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !options.contains(raw.timestamp) {
                continue;
            }

            report.events_loaded += 1;
            channels.load(&raw).await;

            if group {
                if let Some(stream) = grouper.push(raw) {
                    report.streams_loaded += 1;
                    channels.stream(stream).await;
                }
            }
        }

        if report.cancelled {
            break;
        }

        paging = page.next;
        options.pagination_token = Some(paging.to_bytes()?);
        channels.progress(options).await;
    }

    if !report.cancelled {
        if let Some(stream) = grouper.finish() {
            report.streams_loaded += 1;
            channels.stream(stream).await;
        }
    }

    Ok(())
}

async fn index_scan<S>(
    source: &S,
    channels: &mut Channels<'_>,
    options: &mut ReplayOptions,
    event_type_id: &str,
    mut paging: PagingState,
    cancel: &CancellationToken,
    report: &mut ReplayReport,
) -> Result<()>
where
    S: ReplaySource + ?Sized,
{
    while paging.has_more() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let read = IndexReadOptions {
            event_type_id: event_type_id.to_string(),
            after: options.after,
            before: options.before,
            batch_size: options.batch_size,
            order: options.order,
            paging: paging.clone(),
        };
        let page = source.index_store().get_records(&read).await?;
        report.pages += 1;

        for record in page.items {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match source.load_aggregate_event_raw(&record).await {
                Some(raw) => {
                    report.events_loaded += 1;
                    channels.load(&raw).await;
                }
                None => report.missing_records += 1,
            }
        }

        if report.cancelled {
            break;
        }

        paging = page.next;
        options.pagination_token = Some(paging.to_bytes()?);
        channels.progress(options).await;
    }

    Ok(())
}
