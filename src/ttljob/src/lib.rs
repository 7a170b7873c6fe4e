//! Row-level TTL span processor.
//!
//! A processor receives a [`TtlSpec`] describing a slice of a table's primary
//! index. It scans that slice for expired rows with historical selects and
//! removes them in rate-limited, schema-checked delete transactions spread
//! over a bounded pool of workers. Rows deleted are recorded in the job's
//! progress when the run ends, whether or not it succeeded.

pub mod bounds;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod guard;
pub mod keys;
pub mod metrics;
pub mod processor;
pub mod progress;
pub mod ratelimit;
pub mod settings;
pub mod span;
pub mod spec;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bounds::{QueryBounds, Span};
pub use descriptor::{DescriptorCatalog, TableDescriptor};
pub use error::TtlError;
pub use executor::{TtlExecutor, TtlTxn};
pub use metrics::{TtlAggMetrics, TtlMetrics};
pub use processor::{ProcessorContext, ProcessorReport, TtlProcessor};
pub use progress::{
    FileJobRegistry, InMemoryJobRegistry, JobRegistry, ProcessorProgress, RowLevelTtlProgress,
};
pub use settings::TtlSettings;
pub use spec::{JobId, RowLevelTtlDetails, TtlSpec};
