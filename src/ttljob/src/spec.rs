//! Immutable task description handed to a TTL processor.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::config::TtlConfig;

use crate::bounds::Span;
use crate::error::TtlError;
use crate::keys::TableId;

/// Identifier of a TTL job in the job registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the job froze about the table when it was planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLevelTtlDetails {
    /// Rows whose expiration is at or before this instant are deleted.
    pub cutoff: DateTime<Utc>,
    pub table_id: TableId,
    /// Descriptor version observed at job start. Every delete re-checks it.
    pub table_version: u64,
}

/// Task descriptor for one processor instance.
///
/// Constructed once by the job orchestrator and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlSpec {
    pub job_id: JobId,
    pub details: RowLevelTtlDetails,
    /// Primary index key ranges assigned to this processor.
    pub spans: Vec<Span>,
    pub select_batch_size: usize,
    pub delete_batch_size: usize,
    /// Rows per second across all workers of this processor.
    pub delete_rate_limit: u64,
    /// Staleness of the historical select relative to the time it runs.
    #[serde(with = "humantime_serde")]
    pub as_of: Duration,
    /// Operator-supplied statement run once per bound before selecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_delete_statement: Option<String>,
    /// Expression overriding the table's expiration column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_expr: Option<String>,
    /// Testing knob: treat every delete as if the table version had changed.
    #[serde(default)]
    pub pre_delete_change_table_version: bool,
}

impl TtlSpec {
    /// Build a spec from the node's TTL settings.
    pub fn from_config(
        config: &TtlConfig,
        job_id: JobId,
        details: RowLevelTtlDetails,
        spans: Vec<Span>,
    ) -> Self {
        Self {
            job_id,
            details,
            spans,
            select_batch_size: config.select_batch_size,
            delete_batch_size: config.delete_batch_size,
            delete_rate_limit: config.effective_delete_rate_limit(),
            as_of: config.select_as_of,
            pre_delete_statement: None,
            ttl_expr: None,
            pre_delete_change_table_version: false,
        }
    }

    /// Reject specs the select-delete loop cannot run.
    pub fn validate(&self) -> Result<(), TtlError> {
        if self.select_batch_size == 0 {
            return Err(TtlError::InvalidSpec(
                "select batch size must be positive".to_string(),
            ));
        }
        if self.delete_batch_size == 0 {
            return Err(TtlError::InvalidSpec(
                "delete batch size must be positive".to_string(),
            ));
        }
        if self.delete_rate_limit == 0 {
            return Err(TtlError::InvalidSpec(
                "delete rate limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
