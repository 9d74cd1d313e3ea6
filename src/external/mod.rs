//! 外部协作方契约
//!
//! - **MetadataLog** — 事务日志 / 元数据存储，乐观并发提交
//! - **Keeper**      — 协调服务，串行化 (table, revision) 上的宣告/复制记账
//! - **DataWriter**  — 数据文件写入、读取与 compaction
//!
//! `memory` 子模块提供进程内实现，供测试与示例使用。

pub mod memory;

use std::collections::BTreeSet;
use crate::builder::TableChanges;
use crate::common::{Result, RevisionId, TableId};
use crate::config::IndexOptions;
use crate::cube::CubeId;
use crate::field_type::Row;
use crate::meta::{IndexFile, TableSchema};
use crate::snapshot::Snapshot;

// ── 事务日志 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FileAction {
    Add(IndexFile),
    Remove(String),
}

pub type Producer<'a> = dyn FnMut() -> Result<(TableChanges, Vec<FileAction>)> + 'a;

pub trait MetadataLog: Send + Sync {
    fn exists_log(&self, table: &TableId) -> bool;

    fn create_log(&self, table: &TableId, schema: &TableSchema) -> Result<()>;

    fn load_snapshot(&self, table: &TableId) -> Result<Snapshot>;

    fn load_current_schema(&self, table: &TableId) -> Result<TableSchema>;

    /// 恰好执行一次 `producer` 并原子提交。
    ///
    /// `read_version` 是写入者所依据快照的 `Snapshot::version`。以下情况返回
    /// `OTreeError::ConcurrentModification`：
    /// - 该版本之后有提交改变了修订、复制集合或覆盖了表
    /// - 本次提交复制的 cube 在该版本之后又写入了自身数据
    fn update_with_transaction(
        &self,
        table:        &TableId,
        schema:       &TableSchema,
        options:      &IndexOptions,
        append:       bool,
        read_version: u64,
        producer:     &mut Producer<'_>,
    ) -> Result<()>;

    /// 并发复制的 cube 是否有本写入者事先不知道已宣告的
    fn has_conflicts(
        &self,
        table:           &TableId,
        revision_id:     RevisionId,
        known_announced: &BTreeSet<CubeId>,
        old_replicated:  &BTreeSet<CubeId>,
    ) -> Result<bool>;
}

// ── 协调服务 ──────────────────────────────────────────────────────────────────

/// 一次写入在 (table, revision) 上持有的作用域
#[derive(Debug)]
pub struct WriteLease {
    pub table:       TableId,
    pub revision_id: RevisionId,
    pub id:          u64,
    /// 进入作用域时已宣告的 cube
    pub announced:   BTreeSet<CubeId>,
}

pub trait Keeper: Send + Sync {
    fn begin_write(&self, table: &TableId, revision_id: RevisionId) -> WriteLease;

    fn end_write(&self, lease: WriteLease);

    /// 记录选定复制的 cube，对之后进入作用域的写入者可见
    fn announce(&self, table: &TableId, revision_id: RevisionId, cubes: &BTreeSet<CubeId>);

    fn announced(&self, table: &TableId, revision_id: RevisionId) -> BTreeSet<CubeId>;

    /// 复制提交后从宣告集合中移除
    fn finish_replication(&self, table: &TableId, revision_id: RevisionId, cubes: &BTreeSet<CubeId>);
}

impl<'k> dyn Keeper + 'k {
    /// 作用域内执行 `body`，参数为已宣告的 cube
    pub fn with_write<R>(
        &self,
        table:       &TableId,
        revision_id: RevisionId,
        body:        impl FnOnce(&BTreeSet<CubeId>) -> R,
    ) -> R {
        let lease = self.begin_write(table, revision_id);
        let out = body(&lease.announced);
        self.end_write(lease);
        out
    }
}

// ── 数据文件 ──────────────────────────────────────────────────────────────────

pub trait DataWriter: Send + Sync {
    /// 按 `changes.assignments` 把行写成文件，每个文件带 Block 标签
    fn write(
        &self,
        table:   &TableId,
        schema:  &TableSchema,
        rows:    &[Row],
        changes: &TableChanges,
    ) -> Result<Vec<IndexFile>>;

    /// 合并小文件；输出覆盖输入的全部行，每个 (cube, 副本) 的 Block 标签按 `Block::merge` 合并
    fn compact(
        &self,
        table:       &TableId,
        revision_id: RevisionId,
        files:       &[IndexFile],
    ) -> Result<Vec<IndexFile>>;

    /// 读取 `cube` 自身（非传播副本）的行
    fn read_cube(
        &self,
        table: &TableId,
        files: &[IndexFile],
        cube:  &CubeId,
    ) -> Result<Vec<Row>>;
}
