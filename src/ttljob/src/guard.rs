//! Schema stability check run inside every delete transaction.

use crate::descriptor::TableDescriptor;
use crate::error::TtlError;
use crate::executor::TtlTxn;
use crate::spec::{RowLevelTtlDetails, TtlSpec};

/// Rejects deletes once the table's schema has moved past the version the
/// job was planned against.
#[derive(Debug, Clone, Copy)]
pub struct SchemaGuard<'a> {
    details: &'a RowLevelTtlDetails,
    force_changed: bool,
}

impl<'a> SchemaGuard<'a> {
    pub fn new(spec: &'a TtlSpec) -> Self {
        Self {
            details: &spec.details,
            force_changed: spec.pre_delete_change_table_version,
        }
    }

    /// Compare a descriptor against the frozen version.
    pub fn check(&self, desc: &TableDescriptor) -> Result<(), TtlError> {
        if self.force_changed || desc.version != self.details.table_version {
            return Err(TtlError::SchemaChanged {
                modified_at: desc.modified_at,
            });
        }
        Ok(())
    }

    /// Re-fetch the descriptor through `txn` and check it.
    pub async fn validate(&self, txn: &mut dyn TtlTxn) -> Result<TableDescriptor, TtlError> {
        let desc = txn
            .table_descriptor(self.details.table_id)
            .await
            .map_err(TtlError::Delete)?
            .ok_or(TtlError::TableNotFound(self.details.table_id))?;
        self.check(&desc)?;
        Ok(desc)
    }
}
