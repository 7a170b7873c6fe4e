use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use ttljob::executor::TxnPriority;
use ttljob::keys::Datum;
use ttljob::progress::{JobRecord, ProgressMutator};
use ttljob::testing::{MemoryTable, TestSpecBuilder};
use ttljob::{
    FileJobRegistry, InMemoryJobRegistry, JobId, JobRegistry, ProcessorContext, Span,
    TtlError, TtlProcessor, TtlSettings, TtlSpec,
};

const RUN_TIMEOUT: Duration = Duration::from_secs(30);

async fn registered(job_id: JobId) -> Arc<InMemoryJobRegistry> {
    let registry = Arc::new(InMemoryJobRegistry::new());
    registry.register_job(job_id).await.unwrap();
    registry
}

fn processor(
    table: &Arc<MemoryTable>,
    spec: TtlSpec,
    registry: Arc<dyn JobRegistry>,
    worker_concurrency: Option<usize>,
) -> TtlProcessor {
    TtlProcessor::new(spec, table.clone(), table.clone(), registry).with_context(
        ProcessorContext {
            worker_concurrency,
            ..Default::default()
        },
    )
}

/// 10000 rows in 4 spans, rows 1..=2500 expired
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deletes_expired_prefix_of_ten_thousand_rows() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=10_000, 2_500));
    let spec = TestSpecBuilder::for_table(&table)
        .job_id(7)
        .spans(table.split_spans(4))
        .select_batch_size(500)
        .delete_batch_size(200)
        .build();
    let registry = registered(JobId(7)).await;
    let processor = processor(&table, spec, registry.clone(), None);

    let report = timeout(RUN_TIMEOUT, processor.run(CancellationToken::new()))
        .await
        .expect("run finished")
        .unwrap();
    assert_eq!(report.rows_deleted, 2_500);
    assert_eq!(report.span_count, 4);

    let progress = registry.load_progress(JobId(7)).await.unwrap().unwrap();
    assert_eq!(progress.job_row_count, 2_500);
    assert_eq!(progress.processor_progresses.len(), 1);
    let entry = &progress.processor_progresses[0];
    assert_eq!(entry.processor_span_count, 4);
    assert_eq!(entry.processor_row_count, 2_500);
    assert_eq!(entry.processor_concurrency, report.concurrency as u64);

    assert_eq!(table.row_count(), 7_500);
    assert!(!table.contains(&[Datum::Int(2_500)]));
    assert!(table.contains(&[Datum::Int(2_501)]));
    assert!(table.contains(&[Datum::Int(10_000)]));
    assert!(
        table
            .txn_priorities()
            .iter()
            .all(|p| *p == TxnPriority::Low)
    );
}

#[tokio::test]
async fn test_partial_success_is_persisted() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=1_000, 500));
    table.fail_delete_at(4);
    let spec = TestSpecBuilder::for_table(&table)
        .select_batch_size(1_000)
        .delete_batch_size(100)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry.clone(), None);

    let err = processor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TtlError::Delete(_)));
    assert!(err.is_retryable());

    // Three sub-batches committed before the fourth failed.
    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.job_row_count, 300);
    assert_eq!(progress.processor_progresses.len(), 1);
    assert_eq!(table.row_count(), 700);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_worker_drains_queue_without_deadlock() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=1_600, 1_600));
    table.fail_delete_at(1);
    table.set_delete_delay(Duration::from_millis(20));
    let spec = TestSpecBuilder::for_table(&table)
        .spans(table.split_spans(16))
        .select_batch_size(50)
        .delete_batch_size(25)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry.clone(), Some(2));

    let err = timeout(RUN_TIMEOUT, processor.run(CancellationToken::new()))
        .await
        .expect("pool terminated")
        .unwrap_err();
    assert!(matches!(err, TtlError::Delete(_)));

    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.processor_progresses.len(), 1);
    assert_eq!(
        progress.job_row_count,
        1_600 - table.row_count() as u64,
        "persisted count matches committed deletes"
    );
}

#[tokio::test]
async fn test_partial_page_ends_bound_after_one_select() {
    // Only the first span holds expired rows; every bound is exhausted by its first select.
    let table = Arc::new(MemoryTable::with_int_keys(1..=400, 40));
    let spec = TestSpecBuilder::for_table(&table)
        .spans(table.split_spans(4))
        .select_batch_size(500)
        .delete_batch_size(200)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry, Some(1));

    let report = processor.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.rows_deleted, 40);
    assert_eq!(table.select_calls(), 4);
    assert_eq!(table.txns_begun(), 1);
    assert!(table.resume_keys().iter().all(Option::is_none));
}

#[tokio::test]
async fn test_schema_change_aborts_remaining_bounds() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=400, 400));
    // Each span holds 100 expired rows, deleted in two transactions.
    table.bump_version_at_delete(3);
    let spec = TestSpecBuilder::for_table(&table)
        .spans(table.split_spans(4))
        .select_batch_size(200)
        .delete_batch_size(50)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry.clone(), Some(1));

    let err = processor.run(CancellationToken::new()).await.unwrap_err();
    assert!(err.is_schema_change());
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("since the job has started at"));

    // The first bound's deletes committed; the third and fourth bounds never ran.
    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.job_row_count, 100);
    assert_eq!(table.row_count(), 300);
    assert_eq!(table.select_calls(), 2);
}

#[tokio::test]
async fn test_pinned_version_knob_fails_first_delete() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=10, 10));
    let spec = TestSpecBuilder::for_table(&table)
        .pre_delete_change_table_version(true)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry, None);

    let err = processor.run(CancellationToken::new()).await.unwrap_err();
    assert!(err.is_schema_change());
    assert_eq!(table.row_count(), 10);
    assert_eq!(processor.rate_limiter().tokens_acquired(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consumed_tokens_equal_rows_deleted() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=4_000, 1_000));
    let spec = TestSpecBuilder::for_table(&table)
        .spans(table.split_spans(4))
        .select_batch_size(300)
        .delete_batch_size(70)
        .delete_rate_limit(5_000)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry, None);

    let report = processor.run(CancellationToken::new()).await.unwrap();
    let limiter = processor.rate_limiter();
    assert_eq!(report.rows_deleted, 1_000);
    assert_eq!(limiter.tokens_consumed(), report.rows_deleted);
    assert_eq!(limiter.tokens_acquired(), report.rows_deleted);
    assert_eq!(limiter.tokens_abandoned(), 0);
}

#[tokio::test]
async fn test_failed_delete_spends_rate_budget() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=100, 100));
    table.fail_delete_at(2);
    let spec = TestSpecBuilder::for_table(&table)
        .delete_batch_size(30)
        .delete_rate_limit(1_000)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry, None);

    processor.run(CancellationToken::new()).await.unwrap_err();
    let limiter = processor.rate_limiter();
    assert_eq!(limiter.tokens_consumed(), 30);
    assert_eq!(limiter.tokens_abandoned(), 30);
}

/// Applies the first update but reports a failure, as if the acknowledgement was lost.
struct LostAckRegistry {
    inner: InMemoryJobRegistry,
    failed_once: AtomicBool,
}

#[async_trait]
impl JobRegistry for LostAckRegistry {
    async fn register_job(&self, job_id: JobId) -> Result<()> {
        self.inner.register_job(job_id).await
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.inner.load_job(job_id).await
    }

    async fn update_progress(&self, job_id: JobId, mutator: ProgressMutator) -> Result<()> {
        self.inner.update_progress(job_id, mutator).await?;
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            anyhow::bail!("connection reset while acknowledging progress");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_retried_checkpoint_is_not_double_counted() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=200, 120));
    let registry = Arc::new(LostAckRegistry {
        inner: InMemoryJobRegistry::new(),
        failed_once: AtomicBool::new(false),
    });
    registry.register_job(JobId(3)).await.unwrap();

    let build = || {
        let spec = TestSpecBuilder::for_table(&table)
            .job_id(3)
            .spans(table.split_spans(2))
            .build();
        processor(&table, spec, registry.clone(), None)
    };

    let err = build().run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TtlError::Progress { job_id: JobId(3), .. }));

    // The job framework retries the same processor instance.
    let report = build().run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.rows_deleted, 0);

    let progress = registry.load_progress(JobId(3)).await.unwrap().unwrap();
    assert_eq!(progress.job_row_count, 120);
    assert_eq!(progress.processor_progresses.len(), 1);
}

#[tokio::test]
async fn test_distinct_processors_each_append_one_entry() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=400, 400));
    let spans = table.split_spans(2);
    let registry = registered(JobId(1)).await;

    for (processor_id, span) in (1..).zip(spans) {
        let spec = TestSpecBuilder::for_table(&table).spans(vec![span]).build();
        TtlProcessor::new(spec, table.clone(), table.clone(), registry.clone())
            .with_context(ProcessorContext {
                processor_id,
                sql_instance_id: 2,
                worker_concurrency: None,
            })
            .run(CancellationToken::new())
            .await
            .unwrap();
    }

    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.job_row_count, 400);
    let ids: Vec<_> = progress
        .processor_progresses
        .iter()
        .map(|p| (p.processor_id, p.sql_instance_id, p.processor_row_count))
        .collect();
    assert_eq!(ids, vec![(1, 2, 200), (2, 2, 200)]);
}

#[tokio::test]
async fn test_disabled_setting_stops_run() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=100, 100));
    let spec = TestSpecBuilder::for_table(&table).build();
    let registry = registered(JobId(1)).await;
    let settings = TtlSettings::new(false);
    let processor = processor(&table, spec, registry.clone(), None).with_settings(settings);

    let err = processor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TtlError::Disabled));
    assert_eq!(table.select_calls(), 0);
    assert_eq!(table.row_count(), 100);

    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.processor_progresses.len(), 1);
    assert_eq!(progress.job_row_count, 0);
}

#[tokio::test]
async fn test_disabling_mid_run_stops_between_pages() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=1_000, 1_000));
    table.set_select_delay(Duration::from_millis(50));
    let spec = TestSpecBuilder::for_table(&table)
        .select_batch_size(100)
        .build();
    let registry = registered(JobId(1)).await;
    let settings = TtlSettings::new(true);
    let processor =
        processor(&table, spec, registry.clone(), Some(1)).with_settings(settings.clone());

    let run = tokio::spawn(async move { processor.run(CancellationToken::new()).await });
    timeout(RUN_TIMEOUT, async {
        while table.row_count() > 900 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    settings.set_enabled(false);

    let err = timeout(RUN_TIMEOUT, run).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, TtlError::Disabled));
    assert!(table.select_calls() > 1);

    let remaining = table.row_count();
    assert!(remaining > 0 && remaining <= 900);
    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.job_row_count, (1_000 - remaining) as u64);
    assert_eq!(progress.processor_progresses.len(), 1);
}

#[tokio::test]
async fn test_bad_span_key_stops_publishing() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=400, 400));
    let mut spans = table.split_spans(4);
    spans[2] = Span::new(vec![0x20, 0x01], spans[2].end_key.clone());
    let spec = TestSpecBuilder::for_table(&table).spans(spans).build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry.clone(), Some(1));

    let err = processor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TtlError::KeyDecode { .. }));
    assert_eq!(err.to_string(), "decode startKey error key=2001");

    // Bounds published before the bad span still ran.
    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.job_row_count, 200);
    assert_eq!(table.row_count(), 200);
}

#[tokio::test]
async fn test_pre_delete_statement_runs_once_per_bound() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=100, 50));
    let spec = TestSpecBuilder::for_table(&table)
        .spans(table.split_spans(2))
        .pre_delete_statement("DELETE FROM audit_log WHERE stale")
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry, Some(1));

    processor.run(CancellationToken::new()).await.unwrap();
    assert_eq!(
        table.statements(),
        vec!["DELETE FROM audit_log WHERE stale".to_string(); 2]
    );
}

#[tokio::test]
async fn test_pre_delete_statement_failure_aborts_run() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=100, 50));
    table.fail_statements();
    let spec = TestSpecBuilder::for_table(&table)
        .pre_delete_statement("DELETE FROM audit_log WHERE stale")
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry, None);

    let err = processor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TtlError::PreDeleteStatement(_)));
    assert_eq!(table.row_count(), 100);
}

#[tokio::test]
async fn test_select_failure_surfaces_as_select_error() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=100, 50));
    table.fail_selects();
    let spec = TestSpecBuilder::for_table(&table).build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry, None);

    let err = processor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TtlError::Select(_)));
    assert_eq!(err.to_string(), "error selecting rows to delete");
}

#[tokio::test]
async fn test_ttl_expression_reaches_select() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=10, 5));
    table.set_expiration_expr("created_at + INTERVAL '30 days'");
    let registry = registered(JobId(1)).await;

    let spec = TestSpecBuilder::for_table(&table).build();
    processor(&table, spec, registry.clone(), None)
        .run(CancellationToken::new())
        .await
        .unwrap();

    let spec = TestSpecBuilder::for_table(&table)
        .ttl_expr("expire_at")
        .build();
    processor(&table, spec, registry, None)
        .with_context(ProcessorContext {
            processor_id: 2,
            ..Default::default()
        })
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        table.ttl_exprs(),
        vec![
            Some("created_at + INTERVAL '30 days'".to_string()),
            Some("expire_at".to_string())
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_stops_run_and_records_progress() {
    let table = Arc::new(MemoryTable::with_int_keys(1..=1_000, 1_000));
    table.set_delete_delay(Duration::from_millis(100));
    let spec = TestSpecBuilder::for_table(&table)
        .spans(table.split_spans(2))
        .select_batch_size(100)
        .delete_batch_size(10)
        .build();
    let registry = registered(JobId(1)).await;
    let processor = processor(&table, spec, registry.clone(), None);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.cancel();
    });

    let err = timeout(RUN_TIMEOUT, processor.run(cancel))
        .await
        .expect("cancelled run terminates")
        .unwrap_err();
    assert!(matches!(err, TtlError::Cancelled));

    let progress = registry.load_progress(JobId(1)).await.unwrap().unwrap();
    assert_eq!(progress.processor_progresses.len(), 1);
    assert_eq!(progress.job_row_count, 1_000 - table.row_count() as u64);
    assert!(table.row_count() > 0);
}

#[tokio::test]
async fn test_file_registry_records_run() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(FileJobRegistry::new(dir.path()));
    registry.register_job(JobId(11)).await.unwrap();

    let table = Arc::new(MemoryTable::with_int_keys(1..=300, 120));
    let spec = TestSpecBuilder::for_table(&table)
        .job_id(11)
        .spans(table.split_spans(3))
        .build();
    processor(&table, spec, registry, None)
        .run(CancellationToken::new())
        .await
        .unwrap();

    let reopened = FileJobRegistry::new(dir.path());
    let job = reopened.load_job(JobId(11)).await.unwrap().unwrap();
    assert_eq!(job.progress.job_row_count, 120);
    assert_eq!(job.progress.processor_progresses[0].processor_span_count, 3);
}
