//! Select-delete loop run by a worker for one bound pair.
//!
//! Each iteration checks the enable switch, selects a page of expired keys
//! with a historical read, then deletes them in sub-batches. Each sub-batch
//! runs in its own low-priority transaction gated by the schema guard and the
//! rate limiter. The loop ends when a select returns a partial page.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bounds::QueryBounds;
use crate::error::TtlError;
use crate::executor::{DeleteRequest, PrimaryKey, SelectRequest, TtlExecutor, TxnOptions};
use crate::guard::SchemaGuard;
use crate::metrics::TtlMetrics;
use crate::ratelimit::DeleteRateLimiter;
use crate::settings::TtlSettings;
use crate::spec::TtlSpec;

/// Result of processing one bound pair.
///
/// `rows_deleted` counts committed sub-batches and is meaningful even when
/// `result` is an error.
#[derive(Debug)]
pub struct SpanOutcome {
    pub rows_deleted: u64,
    pub result: Result<(), TtlError>,
}

/// Shared, read-only state for running the select-delete loop.
pub struct SpanRunner {
    spec: Arc<TtlSpec>,
    relation: String,
    key_columns: Vec<String>,
    ttl_expr: Option<String>,
    executor: Arc<dyn TtlExecutor>,
    settings: TtlSettings,
    limiter: Arc<DeleteRateLimiter>,
    metrics: TtlMetrics,
}

impl SpanRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: Arc<TtlSpec>,
        relation: String,
        key_columns: Vec<String>,
        ttl_expr: Option<String>,
        executor: Arc<dyn TtlExecutor>,
        settings: TtlSettings,
        limiter: Arc<DeleteRateLimiter>,
        metrics: TtlMetrics,
    ) -> Self {
        Self {
            spec,
            relation,
            key_columns,
            ttl_expr,
            executor,
            settings,
            limiter,
            metrics,
        }
    }

    /// Delete every expired row in `bounds`.
    pub async fn run(&self, bounds: &QueryBounds, cancel: &CancellationToken) -> SpanOutcome {
        let started = Instant::now();
        let _active = self.metrics.span_started();

        let mut rows_deleted = 0;
        let result = self.select_delete(bounds, cancel, &mut rows_deleted).await;

        self.metrics.record_span_total_duration(started.elapsed());
        debug!(
            job_id = %self.spec.job_id,
            bounds = %bounds,
            rows_deleted,
            ok = result.is_ok(),
            "Finished bound pair"
        );
        SpanOutcome {
            rows_deleted,
            result,
        }
    }

    async fn select_delete(
        &self,
        bounds: &QueryBounds,
        cancel: &CancellationToken,
        rows_deleted: &mut u64,
    ) -> Result<(), TtlError> {
        if let Some(statement) = &self.spec.pre_delete_statement {
            until_cancelled(cancel, self.executor.run_statement(statement))
                .await?
                .map_err(TtlError::PreDeleteStatement)?;
        }

        let mut resume_after: Option<PrimaryKey> = None;
        loop {
            self.settings.check_enabled()?;
            if cancel.is_cancelled() {
                return Err(TtlError::Cancelled);
            }

            let started = Instant::now();
            let request = SelectRequest {
                relation: &self.relation,
                key_columns: &self.key_columns,
                bounds,
                resume_after: resume_after.as_deref(),
                cutoff: self.spec.details.cutoff,
                limit: self.spec.select_batch_size,
                as_of: self.spec.as_of,
                ttl_expr: self.ttl_expr.as_deref(),
            };
            let selected = until_cancelled(cancel, self.executor.select_expired(request)).await?;
            self.metrics.record_select_duration(started.elapsed());
            let batch = selected.map_err(TtlError::Select)?;
            self.metrics.record_rows_selected(batch.rows.len() as u64);

            debug!(
                job_id = %self.spec.job_id,
                rows = batch.rows.len(),
                has_next = batch.has_next,
                "Selected expired rows"
            );

            for chunk in batch.rows.chunks(self.spec.delete_batch_size) {
                *rows_deleted += self.delete_batch(chunk, cancel).await?;
            }

            if !batch.has_next {
                return Ok(());
            }
            match batch.rows.into_iter().last() {
                Some(last) => resume_after = Some(last),
                None => return Ok(()),
            }
        }
    }

    /// Delete one sub-batch in its own transaction, returning rows deleted.
    async fn delete_batch(
        &self,
        rows: &[PrimaryKey],
        cancel: &CancellationToken,
    ) -> Result<u64, TtlError> {
        let mut txn = until_cancelled(cancel, self.executor.begin(TxnOptions::ttl_delete()))
            .await?
            .map_err(TtlError::Delete)?;
        until_cancelled(cancel, SchemaGuard::new(&self.spec).validate(txn.as_mut())).await??;

        let tokens = self.limiter.acquire(rows.len() as u64, cancel).await?;
        let started = Instant::now();

        let request = DeleteRequest {
            relation: &self.relation,
            key_columns: &self.key_columns,
            rows,
            cutoff: self.spec.details.cutoff,
            ttl_expr: self.ttl_expr.as_deref(),
        };
        let deleted = until_cancelled(cancel, txn.delete_expired(request))
            .await?
            .map_err(TtlError::Delete)?;
        until_cancelled(cancel, txn.commit())
            .await?
            .map_err(TtlError::Delete)?;
        tokens.consume();

        self.metrics.record_delete_duration(started.elapsed());
        self.metrics.record_rows_deleted(deleted);
        debug!(
            job_id = %self.spec.job_id,
            rows = rows.len(),
            deleted,
            "Deleted expired rows"
        );
        Ok(deleted)
    }
}

/// Await `fut`, giving up with [`TtlError::Cancelled`] once `cancel` fires.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, TtlError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TtlError::Cancelled),
        output = fut => Ok(output),
    }
}
