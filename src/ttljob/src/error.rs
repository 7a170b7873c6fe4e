//! Errors surfaced by a TTL processor run.

use chrono::{DateTime, Utc};
use thiserror::Error;

use common::config::TTL_JOB_ENABLED_SETTING;

use crate::bounds::{BoundsDecodeError, SpanBoundary};
use crate::keys::{KeyDecodeError, TableId};
use crate::spec::JobId;

/// The single error a processor run reports to the job framework.
#[derive(Error, Debug)]
pub enum TtlError {
    /// The spec handed to the processor is unusable.
    #[error("invalid TTL spec: {0}")]
    InvalidSpec(String),

    /// The target table does not exist (dropped or never created).
    #[error("table {0} not found")]
    TableNotFound(TableId),

    /// The target table exists but has no row-level TTL configured.
    #[error("unable to find TTL on table {0}")]
    TtlNotConfigured(String),

    /// The descriptor lookup itself failed.
    #[error("error fetching table descriptor for TTL")]
    Descriptor(#[source] anyhow::Error),

    /// A span boundary could not be decoded against the primary index.
    #[error("decode {boundary} error key={key}")]
    KeyDecode {
        boundary: SpanBoundary,
        key: String,
        #[source]
        source: KeyDecodeError,
    },

    /// TTL work was switched off while the job was running.
    #[error("ttl jobs are currently disabled by setting {}", TTL_JOB_ENABLED_SETTING)]
    Disabled,

    /// The table's schema changed after the job captured its version.
    #[error(
        "table has had a schema change since the job has started at {}, aborting",
        .modified_at.to_rfc3339()
    )]
    SchemaChanged { modified_at: DateTime<Utc> },

    /// The operator-supplied pre-delete statement failed.
    #[error("error running pre-delete statement")]
    PreDeleteStatement(#[source] anyhow::Error),

    /// The historical select failed.
    #[error("error selecting rows to delete")]
    Select(#[source] anyhow::Error),

    /// A delete transaction failed.
    #[error("error during row deletion")]
    Delete(#[source] anyhow::Error),

    /// The run was cancelled by the operator or by a failing sibling worker.
    #[error("TTL processor run was cancelled")]
    Cancelled,

    /// The terminal progress checkpoint could not be written.
    #[error("error updating progress of job {job_id}")]
    Progress {
        job_id: JobId,
        #[source]
        source: anyhow::Error,
    },

    /// A worker task panicked.
    #[error("TTL worker panicked: {0}")]
    WorkerPanicked(String),
}

impl TtlError {
    /// Whether re-running the same plan could succeed.
    ///
    /// Schema drift, disabling, and resolution failures need the job to be
    /// re-planned or re-enabled; I/O failures may clear up on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TtlError::Descriptor(_)
                | TtlError::PreDeleteStatement(_)
                | TtlError::Select(_)
                | TtlError::Delete(_)
                | TtlError::Progress { .. }
        )
    }

    /// Whether this error was caused by a schema change during the run.
    pub fn is_schema_change(&self) -> bool {
        matches!(self, TtlError::SchemaChanged { .. })
    }
}

impl From<BoundsDecodeError> for TtlError {
    fn from(err: BoundsDecodeError) -> Self {
        TtlError::KeyDecode {
            boundary: err.boundary,
            key: hex::encode(&err.key),
            source: err.source,
        }
    }
}
