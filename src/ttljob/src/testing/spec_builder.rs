//! Fluent builder for TTL specs used in tests.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bounds::Span;
use crate::keys::{TableId, index_prefix, prefix_end};
use crate::spec::{JobId, RowLevelTtlDetails, TtlSpec};

use super::MemoryTable;

/// Builder for [`TtlSpec`] with test-friendly defaults.
///
/// # Example
///
/// ```rust,ignore
/// use ttljob::testing::{MemoryTable, TestSpecBuilder};
///
/// let table = MemoryTable::with_int_keys(1..=100, 10);
/// let spec = TestSpecBuilder::for_table(&table)
///     .spans(table.split_spans(4))
///     .select_batch_size(50)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestSpecBuilder {
    spec: TtlSpec,
}

impl TestSpecBuilder {
    /// Spec for `table_id` at version 1, covering the whole primary index,
    /// with an unlimited delete rate.
    pub fn new(table_id: TableId) -> Self {
        let prefix = index_prefix(table_id, 1);
        let end = prefix_end(&prefix);
        Self {
            spec: TtlSpec {
                job_id: JobId(1),
                details: RowLevelTtlDetails {
                    cutoff: Utc::now(),
                    table_id,
                    table_version: 1,
                },
                spans: vec![Span::new(prefix, end)],
                select_batch_size: 500,
                delete_batch_size: 100,
                delete_rate_limit: u64::MAX,
                as_of: Duration::from_secs(30),
                pre_delete_statement: None,
                ttl_expr: None,
                pre_delete_change_table_version: false,
            },
        }
    }

    /// Spec matching the table's id, current version and cutoff.
    pub fn for_table(table: &MemoryTable) -> Self {
        let desc = table.descriptor();
        Self::new(desc.id)
            .table_version(desc.version)
            .cutoff(table.cutoff())
            .spans(vec![table.full_span()])
    }

    pub fn job_id(mut self, job_id: i64) -> Self {
        self.spec.job_id = JobId(job_id);
        self
    }

    pub fn table_id(mut self, table_id: TableId) -> Self {
        self.spec.details.table_id = table_id;
        self
    }

    pub fn table_version(mut self, version: u64) -> Self {
        self.spec.details.table_version = version;
        self
    }

    pub fn cutoff(mut self, cutoff: DateTime<Utc>) -> Self {
        self.spec.details.cutoff = cutoff;
        self
    }

    pub fn spans(mut self, spans: Vec<Span>) -> Self {
        self.spec.spans = spans;
        self
    }

    pub fn select_batch_size(mut self, size: usize) -> Self {
        self.spec.select_batch_size = size;
        self
    }

    pub fn delete_batch_size(mut self, size: usize) -> Self {
        self.spec.delete_batch_size = size;
        self
    }

    pub fn delete_rate_limit(mut self, rows_per_second: u64) -> Self {
        self.spec.delete_rate_limit = rows_per_second;
        self
    }

    pub fn as_of(mut self, as_of: Duration) -> Self {
        self.spec.as_of = as_of;
        self
    }

    pub fn pre_delete_statement(mut self, statement: impl Into<String>) -> Self {
        self.spec.pre_delete_statement = Some(statement.into());
        self
    }

    pub fn ttl_expr(mut self, expr: impl Into<String>) -> Self {
        self.spec.ttl_expr = Some(expr.into());
        self
    }

    pub fn pre_delete_change_table_version(mut self, enabled: bool) -> Self {
        self.spec.pre_delete_change_table_version = enabled;
        self
    }

    pub fn build(self) -> TtlSpec {
        self.spec
    }
}
