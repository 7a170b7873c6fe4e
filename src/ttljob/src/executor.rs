//! Query capabilities the processor drives: historical selects and
//! transaction-scoped deletes.
//!
//! Statement text generation belongs to the implementation; requests carry
//! everything needed to build it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bounds::QueryBounds;
use crate::descriptor::TableDescriptor;
use crate::keys::{Datum, TableId};

/// A full primary key tuple.
pub type PrimaryKey = Vec<Datum>;

/// Scheduling priority of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnPriority {
    #[default]
    Normal,
    /// Yields to foreground traffic under admission control.
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnOptions {
    pub priority: TxnPriority,
    /// Statements observe the effects of earlier statements in the same transaction.
    pub stepping: bool,
}

impl TxnOptions {
    /// Options for a TTL delete transaction.
    pub fn ttl_delete() -> Self {
        Self {
            priority: TxnPriority::Low,
            stepping: true,
        }
    }
}

/// One page of expired primary keys within a bound.
#[derive(Debug, Clone)]
pub struct SelectRequest<'a> {
    pub relation: &'a str,
    /// Quoted primary key column names.
    pub key_columns: &'a [String],
    pub bounds: &'a QueryBounds,
    /// Resume strictly after this key; `None` starts at `bounds.start`.
    pub resume_after: Option<&'a [Datum]>,
    pub cutoff: DateTime<Utc>,
    pub limit: usize,
    /// Read as of `now - as_of`.
    pub as_of: Duration,
    pub ttl_expr: Option<&'a str>,
}

/// Keys returned by a select, in primary index order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectBatch {
    pub rows: Vec<PrimaryKey>,
    /// The page was exactly full, so more expired rows may remain in the bound.
    pub has_next: bool,
}

impl SelectBatch {
    pub fn from_rows(rows: Vec<PrimaryKey>, limit: usize) -> Self {
        let has_next = rows.len() == limit;
        Self { rows, has_next }
    }
}

/// Delete of specific primary keys, re-checking expiry against the cutoff.
#[derive(Debug, Clone)]
pub struct DeleteRequest<'a> {
    pub relation: &'a str,
    pub key_columns: &'a [String],
    pub rows: &'a [PrimaryKey],
    pub cutoff: DateTime<Utc>,
    pub ttl_expr: Option<&'a str>,
}

/// Executes TTL statements against the table.
#[async_trait]
pub trait TtlExecutor: Send + Sync {
    /// Run an arbitrary statement outside any TTL transaction, returning rows affected.
    async fn run_statement(&self, statement: &str) -> anyhow::Result<u64>;

    /// Historical read of expired primary keys.
    async fn select_expired(&self, request: SelectRequest<'_>) -> anyhow::Result<SelectBatch>;

    /// Open a transaction for one delete batch.
    async fn begin(&self, options: TxnOptions) -> anyhow::Result<Box<dyn TtlTxn>>;
}

/// A transaction opened by [`TtlExecutor::begin`].
///
/// Dropping it without calling [`TtlTxn::commit`] rolls it back.
#[async_trait]
pub trait TtlTxn: Send {
    /// Descriptor as seen by this transaction.
    async fn table_descriptor(&mut self, table_id: TableId)
    -> anyhow::Result<Option<TableDescriptor>>;

    /// Delete the requested keys that are still expired, returning rows deleted.
    async fn delete_expired(&mut self, request: DeleteRequest<'_>) -> anyhow::Result<u64>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_next_only_on_full_page() {
        let rows = vec![vec![Datum::Int(1)], vec![Datum::Int(2)]];
        assert!(SelectBatch::from_rows(rows.clone(), 2).has_next);
        assert!(!SelectBatch::from_rows(rows, 3).has_next);
        assert!(!SelectBatch::from_rows(vec![], 3).has_next);
    }

    #[test]
    fn test_delete_transactions_run_at_low_priority() {
        let options = TxnOptions::ttl_delete();
        assert_eq!(options.priority, TxnPriority::Low);
        assert!(options.stepping);
    }
}
