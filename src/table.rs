//! 表句柄与目录
//!
//! `IndexedTable` 持有协作方与缓存的快照；写入、转换、复制与 compaction
//! 之后缓存失效，下一次读取重新加载。`TableCatalog` 让多个表共享同一组协作方。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;
use crate::common::{Result, RevisionId, TableId};
use crate::config::{IndexOptions, WriterConfig};
use crate::coordinator::{WriteCoordinator, WriteReport};
use crate::cube::CubeId;
use crate::external::memory::{InMemoryDataWriter, InMemoryLog, LocalKeeper};
use crate::external::{DataWriter, Keeper, MetadataLog};
use crate::field_type::Row;
use crate::index::IndexStatus;
use crate::meta::{ExistingFile, TableSchema};
use crate::query::{Expr, QueryExecutor, QueryResult};
use crate::revision::Revision;
use crate::snapshot::Snapshot;

/// 共享的外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub log:    Arc<dyn MetadataLog>,
    pub keeper: Arc<dyn Keeper>,
    pub writer: Arc<dyn DataWriter>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            log:    Arc::new(InMemoryLog::new()),
            keeper: Arc::new(LocalKeeper::new()),
            writer: Arc::new(InMemoryDataWriter::new()),
        }
    }
}

// ── IndexedTable ──────────────────────────────────────────────────────────────

/// 快照缓存；每次失效 generation 加一，加载期间发生失效的结果不回填
#[derive(Default)]
struct SnapshotCache {
    generation: u64,
    snapshot:   Option<Arc<Snapshot>>,
}

pub struct IndexedTable {
    table_id: TableId,
    parts:    Collaborators,
    config:   WriterConfig,
    cached:   RwLock<SnapshotCache>,
}

impl IndexedTable {
    pub fn new(table_id: TableId, parts: Collaborators, config: WriterConfig) -> Self {
        Self { table_id, parts, config, cached: RwLock::new(SnapshotCache::default()) }
    }

    pub fn table_id(&self) -> &TableId { &self.table_id }

    pub fn config(&self) -> &WriterConfig { &self.config }

    pub fn exists(&self) -> bool { self.parts.log.exists_log(&self.table_id) }

    fn coordinator(&self) -> WriteCoordinator<'_> {
        WriteCoordinator::new(
            self.parts.log.as_ref(), self.parts.keeper.as_ref(), self.parts.writer.as_ref(), &self.config)
    }

    fn invalidate(&self) {
        let mut cache = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        cache.generation += 1;
        cache.snapshot = None;
        debug!(table = %self.table_id, generation = cache.generation, "snapshot invalidated");
    }

    /// 失败的操作同样使缓存失效：冲突说明日志已被他人改变
    fn mutate<T>(&self, op: impl FnOnce(&WriteCoordinator<'_>) -> Result<T>) -> Result<T> {
        let out = op(&self.coordinator());
        self.invalidate();
        out
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    /// 缓存的快照；表尚不存在时返回空快照且不缓存
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let generation = {
            let cache = self.cached.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(s) = cache.snapshot.as_ref() {
                return Ok(Arc::clone(s));
            }
            cache.generation
        };
        if !self.exists() {
            return Ok(Arc::new(Snapshot::empty(self.table_id.clone())));
        }
        let loaded = Arc::new(self.parts.log.load_snapshot(&self.table_id)?);
        let mut cache = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation == generation {
            cache.snapshot = Some(Arc::clone(&loaded));
            debug!(table = %self.table_id, version = loaded.version, "snapshot loaded");
        } else {
            debug!(table = %self.table_id, version = loaded.version, "snapshot invalidated while loading, not cached");
        }
        Ok(loaded)
    }

    pub fn reload(&self) -> Result<Arc<Snapshot>> {
        self.invalidate();
        self.snapshot()
    }

    pub fn latest_revision(&self) -> Result<Option<Revision>> {
        Ok(self.snapshot()?.latest_revision().cloned())
    }

    pub fn index_status(&self, revision_id: RevisionId) -> Result<IndexStatus> {
        let snapshot = self.snapshot()?;
        let status = snapshot.index_status(revision_id)?;
        Ok(status.with_announced(self.parts.keeper.announced(&self.table_id, revision_id)))
    }

    pub fn schema(&self) -> Result<TableSchema> {
        self.parts.log.load_current_schema(&self.table_id)
    }

    // ── 写入与维护 ────────────────────────────────────────────────────────────

    pub fn save(
        &self,
        schema:  &TableSchema,
        rows:    &[Row],
        options: &IndexOptions,
        append:  bool,
    ) -> Result<WriteReport> {
        self.mutate(|c| c.write(&self.table_id, schema, rows, options, append))
    }

    pub fn convert(
        &self,
        schema:  &TableSchema,
        files:   &[ExistingFile],
        format:  &str,
        columns: &[String],
    ) -> Result<WriteReport> {
        self.mutate(|c| c.convert(&self.table_id, schema, files, format, columns))
    }

    /// 未指定修订时作用于最新修订
    fn resolve(&self, revision_id: Option<RevisionId>) -> Result<Option<RevisionId>> {
        match revision_id {
            Some(id) => Ok(Some(id)),
            None => Ok(self.snapshot()?.latest_revision_id()),
        }
    }

    pub fn analyze(&self, revision_id: Option<RevisionId>) -> Result<Vec<CubeId>> {
        match self.resolve(revision_id)? {
            Some(id) => self.coordinator().analyze(&self.table_id, id),
            None => Ok(vec![]),
        }
    }

    pub fn optimize(&self, revision_id: Option<RevisionId>) -> Result<WriteReport> {
        match self.resolve(revision_id)? {
            Some(id) => self.mutate(|c| c.optimize(&self.table_id, id)),
            None => Ok(WriteReport::default()),
        }
    }

    pub fn compact(&self, revision_id: Option<RevisionId>) -> Result<WriteReport> {
        match self.resolve(revision_id)? {
            Some(id) => self.mutate(|c| c.compact(&self.table_id, id)),
            None => Ok(WriteReport::default()),
        }
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    pub fn query(&self, filters: &[Expr], partition_filters: &[Expr]) -> Result<QueryResult> {
        let snapshot = self.snapshot()?;
        Ok(QueryExecutor::new(&snapshot).execute(filters, partition_filters))
    }

    /// 按比例采样，附加在其余过滤条件上
    pub fn sample(&self, fraction: f64, filters: &[Expr]) -> Result<QueryResult> {
        let mut all = filters.to_vec();
        all.push(Expr::sample(fraction));
        self.query(&all, &[])
    }
}

// ── TableCatalog ──────────────────────────────────────────────────────────────

/// 表句柄注册表，所有表共享一组协作方
pub struct TableCatalog {
    parts:  Collaborators,
    config: WriterConfig,
    tables: RwLock<HashMap<TableId, Arc<IndexedTable>>>,
}

impl TableCatalog {
    pub fn new(parts: Collaborators, config: WriterConfig) -> Self {
        Self { parts, config, tables: RwLock::new(HashMap::new()) }
    }

    pub fn in_memory() -> Self { Self::new(Collaborators::in_memory(), WriterConfig::default()) }

    /// 取得（必要时创建）表句柄；同一表总是返回同一句柄
    pub fn table(&self, table_id: &TableId) -> Arc<IndexedTable> {
        if let Some(t) = self.tables.read().unwrap_or_else(PoisonError::into_inner).get(table_id) {
            return Arc::clone(t);
        }
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(tables.entry(table_id.clone()).or_insert_with(|| {
            Arc::new(IndexedTable::new(table_id.clone(), self.parts.clone(), self.config.clone()))
        }))
    }

    pub fn drop_handle(&self, table_id: &TableId) -> bool {
        self.tables.write().unwrap_or_else(PoisonError::into_inner).remove(table_id).is_some()
    }

    pub fn handle_count(&self) -> usize {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
