//! TTL span processor: distributes a job's spans over a bounded worker pool
//! and records the processor's progress when the pool finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bounds::{QueryBounds, Span};
use crate::descriptor::{DescriptorCatalog, TableDescriptor};
use crate::error::TtlError;
use crate::executor::TtlExecutor;
use crate::keys::{ColumnType, Direction, TableId};
use crate::metrics::TtlAggMetrics;
use crate::progress::{JobRegistry, ProcessorProgress};
use crate::ratelimit::DeleteRateLimiter;
use crate::settings::TtlSettings;
use crate::span::SpanRunner;
use crate::spec::TtlSpec;

/// Identity and placement of one processor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorContext {
    pub processor_id: i32,
    pub sql_instance_id: i32,
    /// Upper bound on the worker count, on top of available parallelism.
    pub worker_concurrency: Option<usize>,
}

impl Default for ProcessorContext {
    fn default() -> Self {
        Self {
            processor_id: 1,
            sql_instance_id: 1,
            worker_concurrency: None,
        }
    }
}

/// Summary of a successful processor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorReport {
    pub rows_deleted: u64,
    pub span_count: usize,
    pub concurrency: usize,
}

/// Runs one [`TtlSpec`] to completion.
pub struct TtlProcessor {
    spec: Arc<TtlSpec>,
    context: ProcessorContext,
    catalog: Arc<dyn DescriptorCatalog>,
    executor: Arc<dyn TtlExecutor>,
    registry: Arc<dyn JobRegistry>,
    limiter: Arc<DeleteRateLimiter>,
    settings: TtlSettings,
    metrics: TtlAggMetrics,
}

impl TtlProcessor {
    pub fn new(
        spec: TtlSpec,
        catalog: Arc<dyn DescriptorCatalog>,
        executor: Arc<dyn TtlExecutor>,
        registry: Arc<dyn JobRegistry>,
    ) -> Self {
        let limiter = Arc::new(DeleteRateLimiter::new(spec.delete_rate_limit));
        Self {
            spec: Arc::new(spec),
            context: ProcessorContext::default(),
            catalog,
            executor,
            registry,
            limiter,
            settings: TtlSettings::default(),
            metrics: TtlAggMetrics::default(),
        }
    }

    pub fn with_context(mut self, context: ProcessorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_settings(mut self, settings: TtlSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metrics(mut self, metrics: TtlAggMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn spec(&self) -> &TtlSpec {
        &self.spec
    }

    /// Limiter shared by every worker of this processor.
    pub fn rate_limiter(&self) -> &DeleteRateLimiter {
        &self.limiter
    }

    /// Number of workers for `span_count` spans.
    pub fn concurrency(&self, span_count: usize) -> usize {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut concurrency = span_count.min(parallelism);
        if let Some(cap) = self.context.worker_concurrency {
            concurrency = concurrency.min(cap.max(1));
        }
        concurrency
    }

    /// Run the processor.
    ///
    /// Once the worker pool has started, a progress entry with the rows
    /// actually deleted is written exactly once, whether or not the run
    /// succeeded. The first error raised by any worker or by span decoding
    /// is returned; later errors are logged and discarded. Cancellation only
    /// fails the run when it interrupted a span or the distribution of
    /// spans; a token cancelled after every span finished is ignored.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ProcessorReport, TtlError> {
        let spec = &self.spec;
        spec.validate()?;

        let desc = self.resolve_descriptor().await?;
        let ttl = desc
            .row_level_ttl
            .as_ref()
            .ok_or_else(|| TtlError::TtlNotConfigured(desc.relation_name()))?;
        let relation = desc.relation_name();
        let metrics = self.metrics.metrics_for(ttl.label_metrics, &relation);
        let ttl_expr = spec
            .ttl_expr
            .clone()
            .or_else(|| ttl.expiration_expr.clone());

        let span_count = spec.spans.len();
        let concurrency = self.concurrency(span_count);

        info!(
            job_id = %spec.job_id,
            table_id = spec.details.table_id,
            processor_id = self.context.processor_id,
            relation = %relation,
            span_count,
            concurrency,
            "Starting TTL processor"
        );

        let runner = Arc::new(SpanRunner::new(
            Arc::clone(spec),
            relation.clone(),
            desc.primary_index.quoted_column_names(),
            ttl_expr,
            Arc::clone(&self.executor),
            self.settings.clone(),
            Arc::clone(&self.limiter),
            metrics,
        ));

        let pool = WorkerPool::start(runner, concurrency, cancel.child_token());
        let distributed = distribute(
            &spec.spans,
            spec.details.table_id,
            &desc.primary_index.column_types(),
            &desc.primary_index.column_directions(),
            pool.sender,
            &pool.cancel,
        )
        .await;
        if let Err(err) = distributed {
            pool.errors.record(err);
        }
        for joined in join_all(pool.workers).await {
            if let Err(join_err) = joined {
                pool.errors
                    .record(TtlError::WorkerPanicked(join_err.to_string()));
            }
        }

        let rows_deleted = pool.rows_deleted.load(Ordering::SeqCst);
        let result = pool.errors.take();

        let checkpoint = self
            .checkpoint(rows_deleted, span_count, concurrency)
            .await;

        match (result, checkpoint) {
            (Some(err), checkpoint) => {
                if let Err(checkpoint_err) = checkpoint {
                    warn!(
                        job_id = %spec.job_id,
                        error = %checkpoint_err,
                        "Failed to record progress of failed TTL processor"
                    );
                }
                warn!(
                    job_id = %spec.job_id,
                    processor_id = self.context.processor_id,
                    rows_deleted,
                    error = %err,
                    "TTL processor failed"
                );
                Err(err)
            }
            (None, Err(checkpoint_err)) => Err(checkpoint_err),
            (None, Ok(())) => {
                info!(
                    job_id = %spec.job_id,
                    processor_id = self.context.processor_id,
                    rows_deleted,
                    "TTL processor completed"
                );
                Ok(ProcessorReport {
                    rows_deleted,
                    span_count,
                    concurrency,
                })
            }
        }
    }

    async fn resolve_descriptor(&self) -> Result<TableDescriptor, TtlError> {
        let table_id = self.spec.details.table_id;
        self.catalog
            .table_descriptor(table_id)
            .await
            .map_err(TtlError::Descriptor)?
            .ok_or(TtlError::TableNotFound(table_id))
    }

    /// Append this processor's entry to the job's progress.
    async fn checkpoint(
        &self,
        rows_deleted: u64,
        span_count: usize,
        concurrency: usize,
    ) -> Result<(), TtlError> {
        let job_id = self.spec.job_id;
        let entry = ProcessorProgress {
            processor_id: self.context.processor_id,
            sql_instance_id: self.context.sql_instance_id,
            processor_row_count: rows_deleted,
            processor_span_count: span_count as u64,
            processor_concurrency: concurrency as u64,
        };

        self.registry
            .update_progress(
                job_id,
                Box::new(move |progress| {
                    if !progress.record_processor(entry) {
                        warn!(
                            job_id = %job_id,
                            "Progress for this processor was already recorded"
                        );
                    }
                    Ok(())
                }),
            )
            .await
            .map_err(|source| TtlError::Progress { job_id, source })?;

        info!(
            job_id = %job_id,
            rows_deleted,
            span_count,
            "Recorded TTL processor progress"
        );
        Ok(())
    }
}

/// First error raised by the pool or the distributor.
#[derive(Default)]
struct FirstError(Mutex<Option<TtlError>>);

impl FirstError {
    fn record(&self, err: TtlError) {
        let mut slot = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        } else if !matches!(err, TtlError::Cancelled) {
            warn!(error = %err, "Discarding TTL worker error after an earlier failure");
        }
    }

    fn take(&self) -> Option<TtlError> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

struct WorkerPool {
    sender: Sender<QueryBounds>,
    workers: Vec<JoinHandle<()>>,
    rows_deleted: Arc<AtomicU64>,
    errors: Arc<FirstError>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn every worker before any bound pair is published.
    fn start(runner: Arc<SpanRunner>, concurrency: usize, cancel: CancellationToken) -> Self {
        let (sender, receiver) = async_channel::bounded(concurrency.max(1));
        let rows_deleted = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(FirstError::default());

        let workers = (0..concurrency)
            .map(|_| {
                tokio::spawn(worker(
                    receiver.clone(),
                    Arc::clone(&runner),
                    Arc::clone(&rows_deleted),
                    Arc::clone(&errors),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            sender,
            workers,
            rows_deleted,
            errors,
            cancel,
        }
    }
}

async fn worker(
    receiver: Receiver<QueryBounds>,
    runner: Arc<SpanRunner>,
    rows_deleted: Arc<AtomicU64>,
    errors: Arc<FirstError>,
    cancel: CancellationToken,
) {
    while let Ok(bounds) = receiver.recv().await {
        let outcome = runner.run(&bounds, &cancel).await;
        rows_deleted.fetch_add(outcome.rows_deleted, Ordering::SeqCst);

        if let Err(err) = outcome.result {
            errors.record(err);
            cancel.cancel();
            // Keep receiving until the distributor closes the queue so it
            // can never block on a full channel.
            while receiver.recv().await.is_ok() {}
            return;
        }
    }
}

/// Decode spans into bound pairs and publish them.
///
/// Dropping `sender` on return closes the queue. A decode failure stops
/// publishing; bound pairs already queued are still processed.
async fn distribute(
    spans: &[Span],
    table_id: TableId,
    types: &[ColumnType],
    dirs: &[Direction],
    sender: Sender<QueryBounds>,
    cancel: &CancellationToken,
) -> Result<(), TtlError> {
    for span in spans {
        let bounds = QueryBounds::from_span(table_id, types, dirs, span)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TtlError::Cancelled),
            sent = sender.send(bounds) => {
                if sent.is_err() {
                    // Every worker is gone.
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
