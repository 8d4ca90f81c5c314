//! End-to-end pipeline runs against a scripted source and an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use litharvest_common::HarvestError;
use litharvest_db::{InMemoryRecordStore, RecordStore};
use litharvest_ingestion::{run_pipeline, run_pipeline_with_progress, WindowOrder, WindowStatus};
use litharvest_test_utils::{date, fast_job, pubmed_record, pubmed_records, FakeSource, FlakyStore};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn memory_store() -> Arc<InMemoryRecordStore> {
    Arc::new(InMemoryRecordStore::new())
}

#[tokio::test]
async fn test_target_splits_final_batch() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1000, 400, date(2024, 1, 10)));
    let store = memory_store();
    let job = fast_job(250, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, store.clone(), CancellationToken::new())
        .await
        .unwrap();

    let sizes: Vec<usize> = source.searches().iter().map(|s| s.max_results).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    let offsets: Vec<usize> = source.searches().iter().map(|s| s.start_offset).collect();
    assert_eq!(offsets, vec![0, 100, 200]);

    assert_eq!(summary.records_stored, 250);
    assert_eq!(summary.final_total, 250);
    assert!(summary.target_reached);
    assert_eq!(summary.batches_processed, 3);
    assert_eq!(store.count_all().await.unwrap(), 250);
}

#[tokio::test]
async fn test_store_already_at_target_does_nothing() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 20, date(2024, 1, 10)));
    let store = memory_store();
    store.seed(pubmed_records(500, 5, date(2023, 6, 1))).await.unwrap();
    let job = fast_job(5, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, store, CancellationToken::new()).await.unwrap();

    assert_eq!(source.search_count(), 0);
    assert_eq!(summary.initial_total, 5);
    assert!(summary.target_reached);
    assert_eq!(summary.windows_planned, 0);
}

#[tokio::test]
async fn test_empty_window_is_exhausted_and_next_window_runs() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 30, date(2024, 2, 14)));
    let store = memory_store();
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 2, 29));

    let summary = run_pipeline(&job, &source, store, CancellationToken::new()).await.unwrap();

    let searches = source.searches();
    assert_eq!(searches.len(), 2);
    assert_eq!(searches[0].date_range.unwrap().start, date(2024, 1, 1));
    assert_eq!(searches[1].date_range.unwrap().start, date(2024, 2, 1));
    assert_eq!(summary.windows_planned, 2);
    assert_eq!(summary.windows_exhausted, 2);
    assert_eq!(summary.records_stored, 30);
    assert!(!summary.target_reached);
}

#[tokio::test]
async fn test_most_recent_window_first() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 3, date(2024, 1, 5)));
    let job = litharvest_ingestion::HarvestJob {
        order: WindowOrder::MostRecentFirst,
        ..fast_job(1_000, 100, date(2024, 1, 1), date(2024, 3, 31))
    };

    run_pipeline(&job, &source, memory_store(), CancellationToken::new()).await.unwrap();

    let starts: Vec<_> = source.searches().iter().map(|s| s.date_range.unwrap().start).collect();
    assert_eq!(starts, vec![date(2024, 3, 1), date(2024, 2, 1), date(2024, 1, 1)]);
}

#[tokio::test]
async fn test_full_page_then_empty_page_terminates_window() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 100, date(2024, 1, 10)));
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, memory_store(), CancellationToken::new()).await.unwrap();

    let offsets: Vec<usize> = source.searches().iter().map(|s| s.start_offset).collect();
    assert_eq!(offsets, vec![0, 100]);
    assert_eq!(summary.records_stored, 100);
    assert_eq!(summary.windows_exhausted, 1);
}

#[tokio::test]
async fn test_malformed_entry_counts_as_failed() {
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 9, date(2024, 1, 10)))
        .with_malformed("99999", date(2024, 1, 10));
    let store = memory_store();
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary.records_fetched, 9);
    assert_eq!(summary.records_stored, 9);
    assert_eq!(summary.records_failed, 1);
    assert!(summary.errors.iter().any(|e| e.contains("99999")));
    assert_eq!(store.count_all().await.unwrap(), 9);
}

#[tokio::test]
async fn test_key_seen_in_earlier_window_is_not_refetched() {
    // PMID 5 is returned by both the January and the February search.
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 10, date(2024, 1, 10)))
        .with_record(pubmed_record("5", date(2024, 2, 3)))
        .with_records(pubmed_records(100, 4, date(2024, 2, 3)));
    let store = memory_store();
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 2, 29));

    let summary = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();

    let fetched = source.fetched_keys();
    assert_eq!(fetched.iter().filter(|k| k.as_str() == "5").count(), 1);
    assert_eq!(summary.duplicates_skipped, 1);
    assert_eq!(summary.records_stored, 14);
    assert_eq!(summary.records_updated, 0);
    assert_eq!(store.count_all().await.unwrap(), 14);
}

#[tokio::test]
async fn test_rerun_updates_instead_of_duplicating() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 12, date(2024, 1, 10)));
    let store = memory_store();
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let first = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();
    let second = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(first.records_stored, 12);
    assert_eq!(second.initial_total, 12);
    assert_eq!(second.records_stored, 0);
    assert_eq!(second.records_updated, 12);
    assert_eq!(second.final_total, 12);
    assert_eq!(store.count_all().await.unwrap(), 12);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_batch_size_above_source_page_cap() {
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 70, date(2024, 1, 10)))
        .with_page_cap(30);
    let store = memory_store();
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();

    let offsets: Vec<usize> = source.searches().iter().map(|s| s.start_offset).collect();
    assert_eq!(offsets, vec![0, 30, 60]);
    assert!(source.searches().iter().all(|s| s.max_results == 30));
    assert_eq!(summary.records_stored, 70);
    assert_eq!(summary.windows_exhausted, 1);
    assert_eq!(store.count_all().await.unwrap(), 70);
}

#[tokio::test]
async fn test_entry_without_id_keeps_page_full() {
    // First page: 9 usable keys and one entry with no id.
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 9, date(2024, 1, 10)))
        .with_keyless_entry(date(2024, 1, 10))
        .with_records(pubmed_records(100, 5, date(2024, 1, 10)));
    let job = fast_job(1_000, 10, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, memory_store(), CancellationToken::new()).await.unwrap();

    let offsets: Vec<usize> = source.searches().iter().map(|s| s.start_offset).collect();
    assert_eq!(offsets, vec![0, 10]);
    assert_eq!(summary.records_stored, 14);
    assert_eq!(summary.records_failed, 1);
    assert!(summary.errors.iter().any(|e| e.contains("missing id")));
}

#[tokio::test]
async fn test_second_query_reaches_target() {
    let source = FakeSource::new("fake")
        .with_query_records("narrow", pubmed_records(1, 5, date(2024, 1, 10)))
        .with_query_records("broad", pubmed_records(100, 50, date(2024, 1, 12)));
    let store = memory_store();
    let job = litharvest_ingestion::HarvestJob {
        queries: vec!["narrow".to_string(), "broad".to_string()],
        ..fast_job(20, 100, date(2024, 1, 1), date(2024, 1, 31))
    };

    let summary = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();

    let queries: Vec<String> = source.searches().into_iter().map(|s| s.query).collect();
    assert_eq!(queries, vec!["narrow", "broad"]);
    let sizes: Vec<usize> = source.searches().iter().map(|s| s.max_results).collect();
    assert_eq!(sizes, vec![20, 15]);
    assert_eq!(summary.windows_planned, 2);
    assert_eq!(summary.windows_exhausted, 1);
    assert_eq!(summary.records_stored, 20);
    assert!(summary.target_reached);
    assert_eq!(store.count_all().await.unwrap(), 20);
}

#[tokio::test]
async fn test_failed_page_is_skipped() {
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 150, date(2024, 1, 10)))
        .fail_search_when(|req| {
            (req.start_offset == 0).then(|| HarvestError::Transient("connection reset".to_string()))
        });
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, memory_store(), CancellationToken::new()).await.unwrap();

    let offsets: Vec<usize> = source.searches().iter().map(|s| s.start_offset).collect();
    assert_eq!(offsets, vec![0, 100]);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.records_stored, 50);
    assert_eq!(summary.windows_exhausted, 1);
    assert!(summary.errors[0].contains("connection reset"));
}

#[tokio::test]
async fn test_window_aborts_after_consecutive_failures() {
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 300, date(2024, 1, 10)))
        .with_records(pubmed_records(500, 7, date(2024, 2, 10)))
        .fail_fetch_when(|keys| {
            keys.iter()
                .any(|k| k.parse::<u32>().is_ok_and(|n| n < 500))
                .then(|| HarvestError::ServerOverload { status: 503, message: "busy".to_string() })
        });
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 2, 29));

    let summary = run_pipeline(&job, &source, memory_store(), CancellationToken::new()).await.unwrap();

    let jan_offsets: Vec<usize> = source
        .searches()
        .iter()
        .filter(|s| s.date_range.unwrap().start == date(2024, 1, 1))
        .map(|s| s.start_offset)
        .collect();
    assert_eq!(jan_offsets, vec![0, 100, 200]);
    assert_eq!(summary.windows_aborted, 1);
    assert_eq!(summary.windows_exhausted, 1);
    assert_eq!(summary.batches_failed, 3);
    assert_eq!(summary.records_stored, 7);
}

#[tokio::test]
async fn test_fatal_error_returns_partial_summary() {
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 20, date(2024, 1, 10)))
        .with_records(pubmed_records(500, 20, date(2024, 2, 10)))
        .fail_search_when(|req| {
            (req.date_range.is_some_and(|r| r.start == date(2024, 2, 1)))
                .then(|| HarvestError::Security("host not in allowlist".to_string()))
        });
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 3, 31));

    let failure = run_pipeline(&job, &source, memory_store(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, HarvestError::Security(_)));
    assert_eq!(failure.summary.records_stored, 20);
    assert_eq!(failure.summary.windows_exhausted, 1);
    // March is never visited
    assert_eq!(source.search_count(), 2);
}

#[tokio::test]
async fn test_count_failure_at_start_is_fatal() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 5, date(2024, 1, 10)));
    let store = Arc::new(FlakyStore::new());
    store.fail_count(true);
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let failure = run_pipeline(&job, &source, store, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(failure.error, HarvestError::Storage(_)));
    assert_eq!(source.search_count(), 0);
}

#[tokio::test]
async fn test_invalid_job_is_fatal() {
    let source = FakeSource::new("fake");
    let job = fast_job(1_000, 0, date(2024, 1, 1), date(2024, 1, 31));

    let failure = run_pipeline(&job, &source, memory_store(), CancellationToken::new()).await.unwrap_err();

    assert!(matches!(failure.error, HarvestError::Config(_)));
    assert_eq!(source.search_count(), 0);
}

#[tokio::test]
async fn test_failed_insert_is_counted_and_run_continues() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 6, date(2024, 1, 10)));
    let store = Arc::new(FlakyStore::new());
    store.fail_inserts_for(["3"]);
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary.records_stored, 5);
    assert_eq!(summary.records_failed, 1);
    assert_eq!(store.insert_calls(), 6);
    assert_eq!(store.count_all().await.unwrap(), 5);
}

#[tokio::test]
async fn test_full_text_enrichment() {
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 3, date(2024, 1, 10)))
        .with_full_text("2", "Full body text.");
    let store = memory_store();
    let job = litharvest_ingestion::HarvestJob {
        enrich_full_text: true,
        ..fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31))
    };

    let summary = run_pipeline(&job, &source, store.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(source.full_text_lookups(), 3);
    assert_eq!(summary.full_texts_found, 1);
    let with_text: Vec<_> = store
        .all()
        .await
        .into_iter()
        .filter_map(|row| row.record.full_text.map(|t| (row.record.natural_key, t)))
        .collect();
    assert_eq!(with_text, vec![("2".to_string(), "Full body text.".to_string())]);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 5, date(2024, 1, 10)));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31));

    let summary = run_pipeline(&job, &source, memory_store(), cancel).await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(source.search_count(), 0);
    assert_eq!(summary.records_stored, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_pacing_delay() {
    let source = FakeSource::new("fake").with_records(pubmed_records(1, 300, date(2024, 1, 10)));
    let cancel = CancellationToken::new();
    let job = litharvest_ingestion::HarvestJob {
        pacing_delay_ms: 2_000,
        ..fast_job(1_000, 100, date(2024, 1, 1), date(2024, 1, 31))
    };

    let (result, _) = tokio::join!(
        run_pipeline(&job, &source, memory_store(), cancel.clone()),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    );

    let summary = result.unwrap();
    assert!(summary.cancelled);
    assert_eq!(source.search_count(), 1);
    assert_eq!(summary.records_stored, 100);
}

#[tokio::test]
async fn test_progress_events_per_window() {
    let source = FakeSource::new("fake")
        .with_records(pubmed_records(1, 4, date(2024, 1, 10)))
        .with_records(pubmed_records(100, 6, date(2024, 2, 10)));
    let job = fast_job(1_000, 100, date(2024, 1, 1), date(2024, 2, 29));
    let (tx, mut rx) = broadcast::channel(16);

    let summary = run_pipeline_with_progress(&job, &source, memory_store(), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    let first = rx.try_recv().unwrap();
    let second = rx.try_recv().unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(first.run_id, summary.run_id);
    assert_eq!(first.query, "");
    assert_eq!((first.current_total, second.current_total), (4, 10));
    assert_eq!(second.status, WindowStatus::Exhausted);
}
