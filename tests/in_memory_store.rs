use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scylla_eventstore::{
    index_records, index_records_for_commit, AggregateCommit, AggregateId, Contract, DomainEvent, EventStore,
    InMemoryEventStore, InMemoryIndexStore, InMemoryMessageCounter, IndexReadOptions, IndexRecord, IndexStore,
    JsonSerializer, MessageCounter, Order, PagingOptions, PagingState, PayloadSerializer, RawEvent, ReplayOperator,
    ReplayOptions, ReplaySource, StoreError, PUBLIC_EVENTS_OFFSET,
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
enum OrderEvent {
    Placed { sku: String },
    Shipped,
    Note(String),
}

impl DomainEvent for OrderEvent {
    fn contract_id(&self) -> &'static str {
        match self {
            OrderEvent::Placed { .. } => "order-placed",
            OrderEvent::Shipped => "order-shipped",
            OrderEvent::Note(_) => "order-note",
        }
    }
}

struct OrderPlaced;

impl Contract for OrderPlaced {
    const CONTRACT_ID: &'static str = "order-placed";
}

fn placed(sku: &str) -> OrderEvent {
    OrderEvent::Placed { sku: sku.to_string() }
}

fn new_id() -> AggregateId {
    AggregateId::from(Uuid::new_v4())
}

/// Appends `revisions` commits of two private events and one public event.
async fn seed(store: &InMemoryEventStore<OrderEvent>, id: AggregateId, revisions: i32) {
    for revision in 1..=revisions {
        let commit = AggregateCommit::new(
            id,
            revision,
            vec![placed(&format!("sku-{}", revision)), OrderEvent::Shipped],
            vec![OrderEvent::Note(format!("public-{}", revision))],
        )
        .with_timestamp(1_000 * revision as i64);
        assert!(store.append(&commit).await.unwrap().is_success());
    }
}

async fn all_rows(store: &InMemoryEventStore<OrderEvent>, id: &AggregateId, take: i32, order: Order) -> Vec<RawEvent> {
    let mut options = PagingOptions::new(take, order);
    let mut rows = Vec::new();
    loop {
        let page = store.load_with_paging(id, &options).await.unwrap();
        assert!(page.items.len() <= take as usize);
        rows.extend(page.items);
        if page.next.is_finished() {
            return rows;
        }
        options = options.with_paging(page.next);
    }
}

#[tokio::test]
async fn test_commits_load_in_revision_order() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let id = new_id();
    seed(&store, id, 3).await;

    let stream = store.load(&id).await.unwrap();
    assert_eq!(stream.revision(), 3);

    let commits = stream.commits();
    assert_eq!(commits.iter().map(|c| c.revision).collect::<Vec<_>>(), vec![1, 2, 3]);
    for commit in commits {
        assert_eq!(commit.events, vec![placed(&format!("sku-{}", commit.revision)), OrderEvent::Shipped]);
        assert_eq!(commit.public_events, vec![OrderEvent::Note(format!("public-{}", commit.revision))]);
        assert_eq!(commit.timestamp, 1_000 * commit.revision as i64);
    }
}

#[tokio::test]
async fn test_unknown_aggregate_loads_empty_stream() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let stream = store.load(&new_id()).await.unwrap();
    assert!(stream.is_empty());
    assert_eq!(stream.revision(), 0);
}

#[tokio::test]
async fn test_single_commit_row_layout() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let id = AggregateId::new([0xAA; 16]);

    let commit = AggregateCommit::new(
        id,
        1,
        vec![OrderEvent::Note("x".into())],
        vec![OrderEvent::Note("y".into())],
    );
    store.append(&commit).await.unwrap();

    let rows = all_rows(&store, &id, 10, Order::Ascending).await;
    assert_eq!(rows.iter().map(|r| r.position).collect::<Vec<_>>(), vec![0, PUBLIC_EVENTS_OFFSET]);
    assert!(rows.iter().all(|r| r.revision == 1));

    // Payload bytes are stored as serialized, untouched.
    let expected = JsonSerializer.serialize(&OrderEvent::Note("x".into())).unwrap();
    assert_eq!(rows[0].data, expected);

    let stream = store.load(&id).await.unwrap();
    assert_eq!(stream.commits().len(), 1);
    assert_eq!(stream.commits()[0].events, vec![OrderEvent::Note("x".into())]);
    assert_eq!(stream.commits()[0].public_events, vec![OrderEvent::Note("y".into())]);
}

#[tokio::test]
async fn test_pagination_is_exhaustive_in_both_orders() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let id = new_id();
    seed(&store, id, 4).await;
    seed(&store, new_id(), 2).await;

    let ascending = all_rows(&store, &id, 5, Order::Ascending).await;
    assert_eq!(ascending.len(), 12);
    assert!(ascending
        .windows(2)
        .all(|w| (w[0].revision, w[0].position) < (w[1].revision, w[1].position)));
    assert!(ascending.iter().all(|r| r.aggregate_id == id));

    let mut descending = all_rows(&store, &id, 5, Order::Descending).await;
    descending.reverse();
    assert_eq!(descending, ascending);
}

#[tokio::test]
async fn test_terminal_cursor_reads_nothing() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let id = new_id();
    seed(&store, id, 1).await;

    let reads = store.reads();
    let options = PagingOptions::new(10, Order::Ascending).with_paging(PagingState::finished());
    let page = store.load_with_paging(&id, &options).await.unwrap();
    assert!(page.items.is_empty());
    assert!(page.next.is_finished());

    let page = store.scan_page(&PagingState::finished(), 10).await.unwrap();
    assert!(page.items.is_empty());
    assert_eq!(store.reads(), reads);
}

#[tokio::test]
async fn test_invalid_cursor_is_rejected() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let options = PagingOptions::new(10, Order::Ascending).with_paging(PagingState::after_page(Some(b"nope".to_vec())));
    let err = store.load_with_paging(&new_id(), &options).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidCursor(_)));
}

#[tokio::test]
async fn test_delete_then_point_lookup_misses() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let id = new_id();
    seed(&store, id, 1).await;

    let rows = all_rows(&store, &id, 10, Order::Ascending).await;
    let target = rows[0].clone();
    let record = IndexRecord::for_event("order-placed", &target);

    assert_eq!(store.load_event_with_rebuild_projection(&record).await.unwrap(), placed("sku-1"));

    assert!(store.delete(&target).await.is_success());
    assert!(store.load_aggregate_event_raw(&record).await.is_none());
    assert!(matches!(
        store.load_event_with_rebuild_projection(&record).await,
        Err(StoreError::MissingIndexedEvent { .. })
    ));
}

#[tokio::test]
async fn test_aggregate_loads_after_public_event_delete() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let id = AggregateId::new([0xAA; 16]);

    let commit = AggregateCommit::new(
        id,
        1,
        vec![OrderEvent::Note("e1".into())],
        vec![OrderEvent::Note("p1".into()), OrderEvent::Note("p2".into())],
    );
    store.append(&commit).await.unwrap();

    let rows = all_rows(&store, &id, 10, Order::Ascending).await;
    let first_public = rows.iter().find(|r| r.position == PUBLIC_EVENTS_OFFSET).unwrap().clone();
    assert!(store.delete(&first_public).await.is_success());

    let stream = store.load(&id).await.unwrap();
    assert_eq!(stream.commits().len(), 1);
    assert_eq!(stream.commits()[0].events, vec![OrderEvent::Note("e1".into())]);
    assert_eq!(stream.commits()[0].public_events, vec![OrderEvent::Note("p2".into())]);
}

#[tokio::test]
async fn test_huge_page_size_returns_everything() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let id = new_id();
    seed(&store, id, 2).await;

    let page = store.scan_page(&PagingState::start(), i32::MAX).await.unwrap();
    assert_eq!(page.items.len(), 6);
    assert!(page.next.is_finished());

    let options = PagingOptions::new(i32::MAX, Order::Descending);
    let page = store.load_with_paging(&id, &options).await.unwrap();
    assert_eq!(page.items.len(), 6);
}

#[tokio::test]
async fn test_append_raw_round_trips_bytes() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let raw = RawEvent {
        aggregate_id: new_id(),
        revision: 1,
        position: 0,
        timestamp: 42,
        data: JsonSerializer.serialize(&OrderEvent::Shipped).unwrap(),
    };
    assert!(store.append_raw(&raw).await.is_success());

    let record = IndexRecord::for_event("order-shipped", &raw);
    assert_eq!(store.load_aggregate_event_raw(&record).await, Some(raw));
}

#[tokio::test]
async fn test_full_replay_emits_one_stream_per_aggregate() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    let ids = [new_id(), new_id(), new_id()];
    for id in ids {
        seed(&store, id, 2).await;
    }

    let loaded = Arc::new(AtomicUsize::new(0));
    let loaded_at_finish = Arc::new(AtomicUsize::new(usize::MAX));
    let streams = Arc::new(Mutex::new(Vec::new()));
    let progress = Arc::new(AtomicUsize::new(0));

    let operator = {
        let loaded = loaded.clone();
        let loaded_at_finish = loaded_at_finish.clone();
        let finish_loaded = loaded.clone();
        let streams = streams.clone();
        let progress = progress.clone();
        ReplayOperator::new()
            .on_load(move |_raw| {
                let loaded = loaded.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    loaded.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_aggregate_stream_loaded(move |stream| {
                let streams = streams.clone();
                async move {
                    streams.lock().unwrap().push((stream.aggregate_id, stream.events.len()));
                    Ok(())
                }
            })
            .notify_progress(move |options| {
                let progress = progress.clone();
                async move {
                    assert!(options.pagination_token.is_some());
                    progress.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_finish(move || {
                let loaded_at_finish = loaded_at_finish.clone();
                let finish_loaded = finish_loaded.clone();
                async move {
                    loaded_at_finish.store(finish_loaded.load(Ordering::SeqCst), Ordering::SeqCst);
                    Ok(())
                }
            })
    };

    let options = ReplayOptions::default().with_batch_size(4).with_parallelism(3);
    let report = store
        .enumerate_event_store(&operator, options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.finished);
    assert!(!report.cancelled);
    assert_eq!(report.events_loaded, 18);
    assert_eq!(report.streams_loaded, 3);
    assert_eq!(report.callback_failures, 0);
    assert_eq!(report.pages, 5);
    assert_eq!(progress.load(Ordering::SeqCst), 5);
    assert_eq!(loaded_at_finish.load(Ordering::SeqCst), 18);

    let mut streams = streams.lock().unwrap().clone();
    streams.sort();
    let mut expected: Vec<_> = ids.iter().map(|id| (*id, 6)).collect();
    expected.sort();
    assert_eq!(streams, expected);
}

#[tokio::test]
async fn test_replay_respects_time_window() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    seed(&store, new_id(), 3).await;

    let operator = ReplayOperator::new();
    let options = ReplayOptions::default().between(Some(2_000), Some(2_000));
    let report = store
        .enumerate_event_store(&operator, options, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.events_loaded, 3);
}

#[tokio::test]
async fn test_replay_resumes_from_progress_token() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    seed(&store, new_id(), 2).await;
    seed(&store, new_id(), 2).await;

    let tokens = Arc::new(Mutex::new(Vec::new()));
    let operator = {
        let tokens = tokens.clone();
        ReplayOperator::new().notify_progress(move |options| {
            let tokens = tokens.clone();
            async move {
                tokens.lock().unwrap().push(options.pagination_token);
                Ok(())
            }
        })
    };

    let options = ReplayOptions::default().with_batch_size(5);
    let first = store
        .enumerate_event_store(&operator, options.clone(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.events_loaded, 12);

    let after_first_page = tokens.lock().unwrap()[0].clone();
    let resumed = store
        .enumerate_event_store(
            &ReplayOperator::new(),
            options.with_pagination_token(after_first_page),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(resumed.events_loaded, 7);
}

#[tokio::test]
async fn test_cancelled_replay_skips_on_finish() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    seed(&store, new_id(), 2).await;

    let finished = Arc::new(AtomicUsize::new(0));
    let operator = {
        let finished = finished.clone();
        ReplayOperator::new().on_finish(move || {
            let finished = finished.clone();
            async move {
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = store
        .enumerate_event_store(&operator, ReplayOptions::default(), &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(!report.finished);
    assert_eq!(report.events_loaded, 0);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_callbacks_do_not_stop_replay() {
    let store = InMemoryEventStore::<OrderEvent>::new();
    seed(&store, new_id(), 2).await;

    let operator = ReplayOperator::new().on_load(|raw| async move {
        if raw.position == PUBLIC_EVENTS_OFFSET {
            anyhow::bail!("cannot project public event");
        }
        Ok(())
    });

    let report = store
        .enumerate_event_store(&operator, ReplayOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.events_loaded, 6);
    assert_eq!(report.callback_failures, 2);
    assert!(report.finished);
}

#[tokio::test]
async fn test_index_replay_counts_missing_events() {
    let index = Arc::new(InMemoryIndexStore::new());
    let store = InMemoryEventStore::<OrderEvent>::with_index(index.clone());
    let id = new_id();

    let commit = AggregateCommit::new(id, 1, vec![placed("a"), OrderEvent::Shipped], vec![]).with_timestamp(500);
    store.append(&commit).await.unwrap();
    let rows = all_rows(&store, &id, 10, Order::Ascending).await;
    for record in index_records_for_commit(&commit, &rows) {
        assert!(index.append(&record).await.is_success());
    }

    let second = AggregateCommit::new(id, 2, vec![placed("b")], vec![]).with_timestamp(600);
    store.append(&second).await.unwrap();
    let second_rows: Vec<RawEvent> = all_rows(&store, &id, 10, Order::Ascending)
        .await
        .into_iter()
        .filter(|r| r.revision == 2)
        .collect();
    for record in index_records_for_commit(&second, &second_rows) {
        index.append(&record).await;
    }
    store.delete(&second_rows[0]).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let operator = {
        let seen = seen.clone();
        ReplayOperator::new().on_load(move |raw| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(raw.revision);
                Ok(())
            }
        })
    };

    let report = store
        .enumerate_event_store(&operator, ReplayOptions::for_event_type("order-placed"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.events_loaded, 1);
    assert_eq!(report.missing_records, 1);
    assert_eq!(report.streams_loaded, 0);
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_index_stream_reports_progress() {
    let index = InMemoryIndexStore::new();
    let id = new_id();
    for revision in 1..=5 {
        let record = IndexRecord {
            event_type_id: "order-placed".into(),
            aggregate_id: id,
            revision,
            position: 0,
            timestamp: revision as i64 * 10,
        };
        index.append(&record).await;
    }

    let mut progress = Vec::new();
    let records: Vec<_> = index_records(&index, IndexReadOptions::new("order-placed", 2), |paging| {
        progress.push(paging.clone())
    })
    .collect()
    .await;

    let revisions: Vec<i32> = records.into_iter().map(|r| r.unwrap().revision).collect();
    assert_eq!(revisions, vec![1, 2, 3, 4, 5]);
    assert_eq!(progress.len(), 3);
    assert!(progress[..2].iter().all(|p| p.has_more()));
    assert!(progress[2].is_finished());

    // Restart from the cursor observed after the first page.
    let mut resume = IndexReadOptions::new("order-placed", 2);
    resume.paging = progress[0].clone();
    let rest: Vec<_> = index_records(&index, resume, |_| {}).collect().await;
    assert_eq!(rest.len(), 3);
}

#[tokio::test]
async fn test_message_counter() {
    let counter = InMemoryMessageCounter::new();

    counter.increment("order-placed", 5).await.unwrap();
    counter.decrement("order-placed", 2).await.unwrap();
    assert_eq!(counter.get_count("order-placed").await.unwrap(), 3);

    counter.reset("order-placed").await.unwrap();
    assert_eq!(counter.get_count("order-placed").await.unwrap(), 0);

    assert_eq!(counter.get_count("never-seen").await.unwrap(), 0);

    counter.increment_for::<OrderPlaced>(4).await.unwrap();
    assert_eq!(counter.count_for::<OrderPlaced>().await.unwrap(), 4);
}
