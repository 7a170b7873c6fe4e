//! In-memory table standing in for the catalog and the SQL executor.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bounds::Span;
use crate::descriptor::{
    DescriptorCatalog, IndexDescriptor, KeyColumn, RowLevelTtl, TableDescriptor,
};
use crate::executor::{
    DeleteRequest, PrimaryKey, SelectBatch, SelectRequest, TtlExecutor, TtlTxn, TxnOptions,
    TxnPriority,
};
use crate::keys::{
    ColumnType, Datum, Direction, TableId, encode_index_key, encode_key_suffix, index_prefix,
    prefix_end,
};

/// Table id used by [`MemoryTable::with_int_keys`].
pub const TEST_TABLE_ID: TableId = 104;

#[derive(Debug, Clone)]
struct StoredRow {
    key: PrimaryKey,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_delete_at: Option<u64>,
    bump_version_at: Option<u64>,
    fail_selects: bool,
    fail_statements: bool,
    select_delay: Option<Duration>,
    delete_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Stats {
    select_calls: u64,
    resume_keys: Vec<Option<PrimaryKey>>,
    ttl_exprs: Vec<Option<String>>,
    txns_begun: u64,
    txn_priorities: Vec<TxnPriority>,
    commits: u64,
    statements: Vec<String>,
}

#[derive(Debug)]
struct TableState {
    desc: TableDescriptor,
    /// Rows keyed by encoded key suffix, so map order is index order.
    rows: BTreeMap<Vec<u8>, StoredRow>,
    faults: Faults,
    stats: Stats,
}

impl TableState {
    fn encode(&self, key: &[Datum]) -> Result<Vec<u8>> {
        let index = &self.desc.primary_index;
        let mut out = Vec::new();
        encode_key_suffix(
            &mut out,
            &index.column_types(),
            &index.column_directions(),
            key,
        )
        .context("encode primary key")?;
        Ok(out)
    }
}

/// A single table held in memory.
///
/// Implements [`DescriptorCatalog`] and [`TtlExecutor`], with knobs to inject
/// failures and schema changes at specific points. Selects read the current
/// state rather than a historical snapshot.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    state: Arc<Mutex<TableState>>,
    cutoff: DateTime<Utc>,
}

impl MemoryTable {
    /// An empty table with the given descriptor and expiry cutoff.
    pub fn new(desc: TableDescriptor, cutoff: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                desc,
                rows: BTreeMap::new(),
                faults: Faults::default(),
                stats: Stats::default(),
            })),
            cutoff,
        }
    }

    /// Table `defaultdb.public.events` keyed by a single `INT8` column `id`.
    ///
    /// The first `expired` keys of `keys` expire an hour before
    /// [`MemoryTable::cutoff`]; the rest expire a day after it.
    pub fn with_int_keys(keys: RangeInclusive<i64>, expired: usize) -> Self {
        let cutoff = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let desc = TableDescriptor {
            id: TEST_TABLE_ID,
            database: "defaultdb".to_string(),
            schema: "public".to_string(),
            name: "events".to_string(),
            version: 1,
            modified_at: cutoff - chrono::Duration::days(7),
            primary_index: IndexDescriptor {
                id: 1,
                key_columns: vec![KeyColumn::new("id", ColumnType::Int, Direction::Asc)],
            },
            row_level_ttl: Some(RowLevelTtl::default()),
        };
        let table = Self::new(desc, cutoff);
        for (i, id) in keys.enumerate() {
            let expires_at = if i < expired {
                cutoff - chrono::Duration::hours(1)
            } else {
                cutoff + chrono::Duration::days(1)
            };
            table.insert(vec![Datum::Int(id)], expires_at);
        }
        table
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a row. Panics if `key` does not match the primary index.
    pub fn insert(&self, key: PrimaryKey, expires_at: DateTime<Utc>) {
        let mut state = self.lock();
        let encoded = state.encode(&key).expect("key matches primary index");
        state.rows.insert(encoded, StoredRow { key, expires_at });
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }

    pub fn descriptor(&self) -> TableDescriptor {
        self.lock().desc.clone()
    }

    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    /// Remaining keys in index order.
    pub fn keys(&self) -> Vec<PrimaryKey> {
        self.lock().rows.values().map(|r| r.key.clone()).collect()
    }

    pub fn contains(&self, key: &[Datum]) -> bool {
        let state = self.lock();
        state
            .encode(key)
            .map(|encoded| state.rows.contains_key(&encoded))
            .unwrap_or(false)
    }

    /// Span covering the whole primary index.
    pub fn full_span(&self) -> Span {
        let desc = self.lock().desc.clone();
        let prefix = index_prefix(desc.id, desc.primary_index.id);
        let end = prefix_end(&prefix);
        Span::new(prefix, end)
    }

    /// Split the primary index into `n` contiguous spans by the first key column.
    ///
    /// The first span starts at the index prefix and the last one ends at
    /// the end of the index. Requires an `INT8` leading key column.
    pub fn split_spans(&self, n: usize) -> Vec<Span> {
        let state = self.lock();
        let desc = &state.desc;
        let types = desc.primary_index.column_types();
        let dirs = desc.primary_index.column_directions();
        let ints: Vec<i64> = state
            .rows
            .values()
            .filter_map(|r| match r.key.first() {
                Some(Datum::Int(v)) => Some(*v),
                _ => None,
            })
            .collect();
        let (Some(lo), Some(hi)) = (ints.iter().min(), ints.iter().max()) else {
            drop(state);
            return vec![self.full_span()];
        };
        if n <= 1 || types.first() != Some(&ColumnType::Int) {
            drop(state);
            return vec![self.full_span()];
        }

        let width = (hi - lo + 1) as u64;
        let step = width.div_ceil(n as u64) as i64;
        let prefix = index_prefix(desc.id, desc.primary_index.id);
        let mut boundaries = vec![prefix.clone()];
        for i in 1..n {
            let split = lo + step * i as i64;
            let key = encode_index_key(desc.id, desc.primary_index.id, &types, &dirs, &[
                Datum::Int(split),
            ])
            .expect("int key encodes");
            boundaries.push(key);
        }
        boundaries.push(prefix_end(&prefix));
        boundaries
            .windows(2)
            .map(|w| Span::new(w[0].clone(), w[1].clone()))
            .collect()
    }

    pub fn set_label_metrics(&self, label_metrics: bool) {
        let mut state = self.lock();
        state
            .desc
            .row_level_ttl
            .get_or_insert_with(RowLevelTtl::default)
            .label_metrics = label_metrics;
    }

    pub fn set_expiration_expr(&self, expr: impl Into<String>) {
        let mut state = self.lock();
        state
            .desc
            .row_level_ttl
            .get_or_insert_with(RowLevelTtl::default)
            .expiration_expr = Some(expr.into());
    }

    pub fn clear_row_level_ttl(&self) {
        self.lock().desc.row_level_ttl = None;
    }

    /// Simulate a schema change.
    pub fn bump_version(&self) {
        let mut state = self.lock();
        state.desc.version += 1;
        state.desc.modified_at = Utc::now();
    }

    /// Fail the delete of the `n`-th delete transaction (1-based).
    pub fn fail_delete_at(&self, n: u64) {
        self.lock().faults.fail_delete_at = Some(n);
    }

    /// Change the schema right before the `n`-th delete transaction (1-based).
    pub fn bump_version_at_delete(&self, n: u64) {
        self.lock().faults.bump_version_at = Some(n);
    }

    pub fn fail_selects(&self) {
        self.lock().faults.fail_selects = true;
    }

    pub fn fail_statements(&self) {
        self.lock().faults.fail_statements = true;
    }

    pub fn set_select_delay(&self, delay: Duration) {
        self.lock().faults.select_delay = Some(delay);
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        self.lock().faults.delete_delay = Some(delay);
    }

    pub fn select_calls(&self) -> u64 {
        self.lock().stats.select_calls
    }

    /// Resume key passed to each select, in call order.
    pub fn resume_keys(&self) -> Vec<Option<PrimaryKey>> {
        self.lock().stats.resume_keys.clone()
    }

    /// TTL expression passed to each select, in call order.
    pub fn ttl_exprs(&self) -> Vec<Option<String>> {
        self.lock().stats.ttl_exprs.clone()
    }

    pub fn txns_begun(&self) -> u64 {
        self.lock().stats.txns_begun
    }

    pub fn txn_priorities(&self) -> Vec<TxnPriority> {
        self.lock().stats.txn_priorities.clone()
    }

    pub fn commits(&self) -> u64 {
        self.lock().stats.commits
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().stats.statements.clone()
    }
}

#[async_trait]
impl DescriptorCatalog for MemoryTable {
    async fn table_descriptor(&self, table_id: TableId) -> Result<Option<TableDescriptor>> {
        let state = self.lock();
        Ok((state.desc.id == table_id).then(|| state.desc.clone()))
    }
}

#[async_trait]
impl TtlExecutor for MemoryTable {
    async fn run_statement(&self, statement: &str) -> Result<u64> {
        let mut state = self.lock();
        state.stats.statements.push(statement.to_string());
        if state.faults.fail_statements {
            bail!("injected statement failure: {statement}");
        }
        Ok(0)
    }

    async fn select_expired(&self, request: SelectRequest<'_>) -> Result<SelectBatch> {
        let delay = {
            let mut state = self.lock();
            state.stats.select_calls += 1;
            state
                .stats
                .resume_keys
                .push(request.resume_after.map(<[Datum]>::to_vec));
            state
                .stats
                .ttl_exprs
                .push(request.ttl_expr.map(str::to_string));
            if state.faults.fail_selects {
                bail!("injected select failure");
            }
            state.faults.select_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        let index = &state.desc.primary_index;
        let bounds = request
            .bounds
            .encode(&index.column_types(), &index.column_directions())
            .context("encode query bounds")?;
        let resume = request
            .resume_after
            .map(|key| state.encode(key))
            .transpose()?;

        let rows = state
            .rows
            .iter()
            .filter(|(key, _)| bounds.contains(key))
            .filter(|(key, _)| resume.as_ref().is_none_or(|r| key.as_slice() > r.as_slice()))
            .filter(|(_, row)| row.expires_at <= request.cutoff)
            .take(request.limit)
            .map(|(_, row)| row.key.clone())
            .collect();
        Ok(SelectBatch::from_rows(rows, request.limit))
    }

    async fn begin(&self, options: TxnOptions) -> Result<Box<dyn TtlTxn>> {
        let mut state = self.lock();
        state.stats.txns_begun += 1;
        state.stats.txn_priorities.push(options.priority);
        let seq = state.stats.txns_begun;
        if state.faults.bump_version_at == Some(seq) {
            state.desc.version += 1;
            state.desc.modified_at = Utc::now();
        }
        Ok(Box::new(MemoryTxn {
            state: Arc::clone(&self.state),
            seq,
            pending: Vec::new(),
        }))
    }
}

/// Transaction buffering deletes until commit.
struct MemoryTxn {
    state: Arc<Mutex<TableState>>,
    seq: u64,
    pending: Vec<Vec<u8>>,
}

impl MemoryTxn {
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TtlTxn for MemoryTxn {
    async fn table_descriptor(&mut self, table_id: TableId) -> Result<Option<TableDescriptor>> {
        let state = self.lock();
        Ok((state.desc.id == table_id).then(|| state.desc.clone()))
    }

    async fn delete_expired(&mut self, request: DeleteRequest<'_>) -> Result<u64> {
        let delay = {
            let state = self.lock();
            if state.faults.fail_delete_at == Some(self.seq) {
                bail!("injected delete failure in transaction {}", self.seq);
            }
            state.faults.delete_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut pending = Vec::with_capacity(request.rows.len());
        {
            let state = self.lock();
            for key in request.rows {
                let encoded = state.encode(key)?;
                if state
                    .rows
                    .get(&encoded)
                    .is_some_and(|row| row.expires_at <= request.cutoff)
                {
                    pending.push(encoded);
                }
            }
        }
        let deleted = pending.len() as u64;
        self.pending.extend(pending);
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.lock();
        for key in &self.pending {
            state.rows.remove(key);
        }
        state.stats.commits += 1;
        Ok(())
    }
}
