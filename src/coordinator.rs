//! 写入协调器
//!
//! 一次写入是显式状态机：
//!
//! ```text
//! START ──► COMPUTE_INDEX_STATUS ──► WRITE_DATA ──► COMMIT ──► SUCCESS
//!   ▲                                                  │
//!   └───────────────── RETRY ◄── 可重试冲突 ◄──────────┤
//!                                                      └──► FATAL
//! ```
//!
//! - START：读取快照，决定沿用修订、生成下一修订或创建新修订
//! - COMPUTE_INDEX_STATUS：在协调作用域内叠加已宣告 cube
//! - WRITE_DATA / COMMIT：在事务日志的生产者中构建索引、写文件并提交
//! - 提交冲突时，只有本写入者事先不知道已宣告的 cube 被并发复制才是致命的；
//!   其余冲突在 `max_retries` 次内重试
//!
//! analyze / optimize / compact 复用同一套重试逻辑。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};
use crate::builder::{IndexBuilder, TableChanges};
use crate::common::{OTreeError, Result, RevisionId, TableId, STAGING_REVISION_ID};
use crate::config::{IndexOptions, WriterConfig};
use crate::cube::{CubeId, MAX_DIMENSIONS};
use crate::external::{DataWriter, FileAction, Keeper, MetadataLog};
use crate::field_type::Row;
use crate::index::IndexStatus;
use crate::meta::{ExistingFile, IndexFile, TableSchema};
use crate::revision::Revision;

/// 支持转换的源表格式
pub const CONVERTIBLE_FORMATS: [&str; 2] = ["parquet", "delta"];

// ── 状态与结果 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Start,
    ComputeIndexStatus,
    WriteData,
    Commit,
    Success,
    Retry,
    Fatal,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start              => "START",
            Self::ComputeIndexStatus => "COMPUTE_INDEX_STATUS",
            Self::WriteData          => "WRITE_DATA",
            Self::Commit             => "COMMIT",
            Self::Success            => "SUCCESS",
            Self::Retry              => "RETRY",
            Self::Fatal              => "FATAL",
        })
    }
}

/// 单次尝试的结果
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Done(T),
    Retryable(OTreeError),
    Fatal(OTreeError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub revision_id:   RevisionId,
    /// 实际尝试次数；空操作为 0
    pub attempts:      u32,
    pub files_added:   usize,
    pub files_removed: usize,
    pub new_revision:  bool,
}

/// START 阶段的决定
struct RevisionPlan {
    base:            IndexStatus,
    revision_change: Option<Revision>,
    staging:         bool,
    /// 所依据快照的版本，提交时据此判定并发改动
    read_version:    u64,
}

impl RevisionPlan {
    fn new_revision(revision: Revision, read_version: u64) -> Self {
        Self {
            staging:         revision.is_staging(),
            base:            IndexStatus::empty(revision.clone()),
            revision_change: Some(revision),
            read_version,
        }
    }

    fn existing(status: &IndexStatus, read_version: u64) -> Self {
        Self {
            staging:         status.revision.is_staging(),
            base:            status.clone(),
            revision_change: None,
            read_version,
        }
    }
}

fn lift<T>(r: Result<T>) -> std::result::Result<T, AttemptOutcome<WriteReport>> {
    r.map_err(AttemptOutcome::Fatal)
}

macro_rules! attempt_try {
    ($e:expr) => {
        match lift($e) {
            Ok(v) => v,
            Err(outcome) => return outcome,
        }
    };
}

// ── 协调器 ────────────────────────────────────────────────────────────────────

pub struct WriteCoordinator<'a> {
    log:    &'a dyn MetadataLog,
    keeper: &'a dyn Keeper,
    writer: &'a dyn DataWriter,
    config: &'a WriterConfig,
}

impl<'a> WriteCoordinator<'a> {
    pub fn new(
        log:    &'a dyn MetadataLog,
        keeper: &'a dyn Keeper,
        writer: &'a dyn DataWriter,
        config: &'a WriterConfig,
    ) -> Self {
        Self { log, keeper, writer, config }
    }

    fn transition(&self, table: &TableId, attempt: u32, state: WriteState) {
        debug!(table = %table, attempt, state = %state, "write state");
    }

    /// 总尝试次数至多 max_retries + 1
    fn run_with_retries<T>(
        &self,
        table:     &TableId,
        operation: &str,
        mut attempt: impl FnMut(u32) -> AttemptOutcome<T>,
    ) -> Result<T> {
        let mut n = 0;
        loop {
            n += 1;
            match attempt(n) {
                AttemptOutcome::Done(v) => {
                    self.transition(table, n, WriteState::Success);
                    return Ok(v);
                }
                AttemptOutcome::Retryable(e) if n <= self.config.max_retries => {
                    self.transition(table, n, WriteState::Retry);
                    warn!(table = %table, operation, attempt = n, error = %e, "retrying after conflict");
                }
                AttemptOutcome::Retryable(e) | AttemptOutcome::Fatal(e) => {
                    self.transition(table, n, WriteState::Fatal);
                    warn!(table = %table, operation, attempt = n, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }

    /// 提交失败的分类
    fn classify<T>(
        &self,
        table:           &TableId,
        revision_id:     RevisionId,
        err:             OTreeError,
        known_announced: &BTreeSet<CubeId>,
        old_replicated:  &BTreeSet<CubeId>,
    ) -> AttemptOutcome<T> {
        if !err.is_retryable() {
            return AttemptOutcome::Fatal(err);
        }
        match self.log.has_conflicts(table, revision_id, known_announced, old_replicated) {
            Ok(true)  => AttemptOutcome::Fatal(err),
            Ok(false) => AttemptOutcome::Retryable(err),
            Err(e)    => AttemptOutcome::Fatal(e),
        }
    }

    // ── 写入 ──────────────────────────────────────────────────────────────────

    /// 写入一批行；`append = false` 时覆盖表中已有文件
    pub fn write(
        &self,
        table:   &TableId,
        schema:  &TableSchema,
        rows:    &[Row],
        options: &IndexOptions,
        append:  bool,
    ) -> Result<WriteReport> {
        if rows.is_empty() {
            debug!(table = %table, "empty batch, nothing to write");
            return Ok(WriteReport::default());
        }
        self.run_with_retries(table, "write", |attempt| {
            self.write_attempt(table, schema, rows, options, append, attempt)
        })
    }

    fn plan(
        &self,
        table:   &TableId,
        schema:  &TableSchema,
        rows:    &[Row],
        options: &IndexOptions,
        append:  bool,
    ) -> Result<RevisionPlan> {
        if !self.log.exists_log(table) {
            self.log.create_log(table, schema)?;
        }
        let snapshot = self.log.load_snapshot(table)?;
        let read_version = snapshot.version;
        let current_max = snapshot.latest_revision_id();
        let latest = snapshot.latest_revision().filter(|_| append);

        match latest {
            Some(rev) if !rev.is_staging() => {
                rev.validate_columns(&options.column_names())?;
                let stats = rev.batch_stats(schema, rows, options)?;
                match rev.compute_changes(options, &stats) {
                    Some(next) => Ok(RevisionPlan::new_revision(next, read_version)),
                    None => Ok(RevisionPlan::existing(snapshot.index_status(rev.revision_id)?, read_version)),
                }
            }
            _ if options.is_indexed() => {
                let rev = Revision::create_new(table.clone(), schema, options, current_max)?;
                let stats = rev.batch_stats(schema, rows, options)?;
                Ok(RevisionPlan::new_revision(rev.with_stats(&stats), read_version))
            }
            _ => match snapshot.index_status(STAGING_REVISION_ID) {
                Ok(status) if append => Ok(RevisionPlan::existing(status, read_version)),
                _ => Ok(RevisionPlan::new_revision(Revision::staging(table.clone(), &[]), read_version)),
            },
        }
    }

    fn write_attempt(
        &self,
        table:   &TableId,
        schema:  &TableSchema,
        rows:    &[Row],
        options: &IndexOptions,
        append:  bool,
        attempt: u32,
    ) -> AttemptOutcome<WriteReport> {
        self.transition(table, attempt, WriteState::Start);
        let plan = attempt_try!(self.plan(table, schema, rows, options, append));
        let revision_id = plan.base.revision.revision_id;

        let lease = self.keeper.begin_write(table, revision_id);
        self.transition(table, attempt, WriteState::ComputeIndexStatus);
        let status = plan.base.with_announced(lease.announced.iter().cloned());

        let mut report = None;
        let result = {
            let mut producer = || -> Result<(TableChanges, Vec<FileAction>)> {
                self.transition(table, attempt, WriteState::WriteData);
                let builder = IndexBuilder::new(&status, schema);
                let changes = if plan.staging {
                    builder.build_staging(rows, plan.revision_change.clone())
                } else {
                    builder.build(rows, plan.revision_change.clone())?
                };
                let files = self.writer.write(table, schema, rows, &changes)?;
                self.transition(table, attempt, WriteState::Commit);
                report = Some(WriteReport {
                    revision_id,
                    attempts:      attempt,
                    files_added:   files.len(),
                    files_removed: 0,
                    new_revision:  changes.revision_change.is_some(),
                });
                let actions = files.iter().cloned().map(FileAction::Add).collect();
                Ok((changes.with_files(&files), actions))
            };
            self.log.update_with_transaction(table, schema, options, append, plan.read_version, &mut producer)
        };
        let known_announced = lease.announced.clone();
        self.keeper.end_write(lease);

        match (result, report) {
            (Ok(()), Some(report)) => {
                info!(table = %table, revision_id, attempt, files = report.files_added,
                      new_revision = report.new_revision, "write committed");
                AttemptOutcome::Done(report)
            }
            (Ok(()), None) => AttemptOutcome::Fatal(OTreeError::Io("transaction committed without running producer".into())),
            (Err(e), _) => self.classify(table, revision_id, e, &known_announced, &plan.base.replicated_set),
        }
    }

    // ── 转换 ──────────────────────────────────────────────────────────────────

    /// 把已有 parquet / delta 表登记为 staging 修订，所有文件归属根 cube
    pub fn convert(
        &self,
        table:   &TableId,
        schema:  &TableSchema,
        files:   &[ExistingFile],
        format:  &str,
        columns: &[String],
    ) -> Result<WriteReport> {
        let format = format.trim().to_ascii_lowercase();
        if !CONVERTIBLE_FORMATS.contains(&format.as_str()) {
            return Err(OTreeError::UnsupportedFormat(format));
        }
        if columns.len() > MAX_DIMENSIONS {
            return Err(OTreeError::invalid_option(
                "columnsToIndex", format!("at most {MAX_DIMENSIONS} columns can be indexed")));
        }
        for c in columns {
            schema.column(c)?;
        }

        self.run_with_retries(table, "convert", |attempt| {
            self.transition(table, attempt, WriteState::Start);
            if !self.log.exists_log(table) {
                attempt_try!(self.log.create_log(table, schema));
            }
            let snapshot = attempt_try!(self.log.load_snapshot(table));
            if !snapshot.is_initial() {
                info!(table = %table, "table already has revisions, conversion skipped");
                return AttemptOutcome::Done(WriteReport { attempts: attempt, ..WriteReport::default() });
            }

            let revision = Revision::staging(table.clone(), columns);
            let root = CubeId::root(columns.len());
            let index_files: Vec<IndexFile> = files.iter().cloned()
                .map(|f| f.into_staging(root.clone()))
                .collect();
            let status = IndexStatus::empty(revision.clone());
            let mut producer = || -> Result<(TableChanges, Vec<FileAction>)> {
                self.transition(table, attempt, WriteState::Commit);
                let changes = TableChanges::empty(&status, Some(revision.clone())).with_files(&index_files);
                Ok((changes, index_files.iter().cloned().map(FileAction::Add).collect()))
            };
            let options = IndexOptions::default();
            match self.log.update_with_transaction(table, schema, &options, true, snapshot.version, &mut producer) {
                Ok(()) => {
                    info!(table = %table, format = %format, files = index_files.len(), "converted table");
                    AttemptOutcome::Done(WriteReport {
                        revision_id:   STAGING_REVISION_ID,
                        attempts:      attempt,
                        files_added:   index_files.len(),
                        files_removed: 0,
                        new_revision:  true,
                    })
                }
                Err(e) => self.classify(table, STAGING_REVISION_ID, e, &BTreeSet::new(), &BTreeSet::new()),
            }
        })
    }

    // ── 维护 ──────────────────────────────────────────────────────────────────

    /// 找出溢出的满 cube 并宣告复制，返回本次宣告的 cube
    pub fn analyze(&self, table: &TableId, revision_id: RevisionId) -> Result<Vec<CubeId>> {
        let snapshot = self.log.load_snapshot(table)?;
        let status = snapshot.index_status(revision_id)?;
        if status.revision.is_staging() {
            return Ok(vec![]);
        }
        let status = status.with_announced(self.keeper.announced(table, revision_id));
        let cubes: BTreeSet<CubeId> = status.overflowed_cubes(self.config.overflow_factor)
            .into_iter()
            .collect();
        self.keeper.announce(table, revision_id, &cubes);
        info!(table = %table, revision_id, announced = cubes.len(), "analyze complete");
        Ok(cubes.into_iter().collect())
    }

    /// 复制已宣告的 cube：读出其自身行并作为副本写入子 cube
    pub fn optimize(&self, table: &TableId, revision_id: RevisionId) -> Result<WriteReport> {
        self.run_with_retries(table, "optimize", |attempt| {
            self.transition(table, attempt, WriteState::Start);
            let snapshot = attempt_try!(self.log.load_snapshot(table));
            let schema = attempt_try!(self.log.load_current_schema(table));
            let base = attempt_try!(snapshot.index_status(revision_id)).clone();

            let lease = self.keeper.begin_write(table, revision_id);
            self.transition(table, attempt, WriteState::ComputeIndexStatus);
            let status = base.with_announced(lease.announced.iter().cloned());
            let pending: BTreeSet<CubeId> = lease.announced.iter()
                .filter(|c| !base.replicated_set.contains(*c))
                .cloned()
                .collect();
            if pending.is_empty() {
                self.keeper.end_write(lease);
                return AttemptOutcome::Done(WriteReport { revision_id, attempts: attempt, ..WriteReport::default() });
            }

            let mut report = None;
            let result = {
                let mut producer = || -> Result<(TableChanges, Vec<FileAction>)> {
                    self.transition(table, attempt, WriteState::WriteData);
                    let mut cube_rows = BTreeMap::new();
                    for cube in &pending {
                        let files: Vec<IndexFile> = status.cube(cube)
                            .map(|c| c.own_blocks()
                                .filter_map(|b| snapshot.file(revision_id, &b.file).cloned())
                                .collect())
                            .unwrap_or_default();
                        cube_rows.insert(cube.clone(), self.writer.read_cube(table, &files, cube)?);
                    }
                    let (changes, rows) = IndexBuilder::new(&status, &schema).replicate(&cube_rows)?;
                    let files = self.writer.write(table, &schema, &rows, &changes)?;
                    self.transition(table, attempt, WriteState::Commit);
                    report = Some(WriteReport {
                        revision_id,
                        attempts:      attempt,
                        files_added:   files.len(),
                        files_removed: 0,
                        new_revision:  false,
                    });
                    let actions = files.iter().cloned().map(FileAction::Add).collect();
                    Ok((changes.with_files(&files), actions))
                };
                self.log.update_with_transaction(
                    table, &schema, &IndexOptions::default(), true, snapshot.version, &mut producer)
            };
            let known_announced = lease.announced.clone();
            self.keeper.end_write(lease);

            match (result, report) {
                (Ok(()), Some(report)) => {
                    self.keeper.finish_replication(table, revision_id, &pending);
                    info!(table = %table, revision_id, cubes = pending.len(), "replicated cubes");
                    AttemptOutcome::Done(report)
                }
                (Ok(()), None) => AttemptOutcome::Fatal(OTreeError::Io("transaction committed without running producer".into())),
                (Err(e), _) => self.classify(table, revision_id, e, &known_announced, &base.replicated_set),
            }
        })
    }

    /// 合并小文件；只替换文件，不改变修订与复制集合
    pub fn compact(&self, table: &TableId, revision_id: RevisionId) -> Result<WriteReport> {
        self.run_with_retries(table, "compact", |attempt| {
            self.transition(table, attempt, WriteState::Start);
            let snapshot = attempt_try!(self.log.load_snapshot(table));
            let schema = attempt_try!(self.log.load_current_schema(table));
            let status = attempt_try!(snapshot.index_status(revision_id)).clone();

            let batches = self.compaction_batches(snapshot.files(revision_id));
            if batches.is_empty() {
                return AttemptOutcome::Done(WriteReport { revision_id, attempts: attempt, ..WriteReport::default() });
            }

            let mut report = None;
            let mut producer = || -> Result<(TableChanges, Vec<FileAction>)> {
                self.transition(table, attempt, WriteState::WriteData);
                let mut added: Vec<IndexFile> = vec![];
                let mut removed: BTreeSet<String> = BTreeSet::new();
                for batch in &batches {
                    added.extend(self.writer.compact(table, revision_id, batch)?);
                    removed.extend(batch.iter().map(|f| f.path.clone()));
                }
                self.transition(table, attempt, WriteState::Commit);
                let mut changes = TableChanges::empty(&status, None);
                changes.updated_status = status.without_files(&removed).with_files(&added);
                report = Some(WriteReport {
                    revision_id,
                    attempts:      attempt,
                    files_added:   added.len(),
                    files_removed: removed.len(),
                    new_revision:  false,
                });
                let actions = removed.into_iter().map(FileAction::Remove)
                    .chain(added.into_iter().map(FileAction::Add))
                    .collect();
                Ok((changes, actions))
            };
            let result = self.log.update_with_transaction(
                table, &schema, &IndexOptions::default(), true, snapshot.version, &mut producer);
            match (result, report) {
                (Ok(()), Some(report)) => {
                    info!(table = %table, revision_id, removed = report.files_removed,
                          added = report.files_added, "compaction committed");
                    AttemptOutcome::Done(report)
                }
                (Ok(()), None) => AttemptOutcome::Fatal(OTreeError::Io("transaction committed without running producer".into())),
                (Err(e), _) => self.classify(table, revision_id, e, &BTreeSet::new(), &status.replicated_set),
            }
        })
    }

    /// 同一分区内小于下限的文件按大小上限贪心分批；单文件的批次不合并
    fn compaction_batches<'f>(&self, files: impl Iterator<Item = &'f IndexFile>) -> Vec<Vec<IndexFile>> {
        let mut by_partition: BTreeMap<&BTreeMap<String, String>, Vec<&IndexFile>> = BTreeMap::new();
        for f in files.filter(|f| f.size < self.config.compaction_min_file_size) {
            by_partition.entry(&f.partition_values).or_default().push(f);
        }

        let mut batches = vec![];
        for group in by_partition.into_values() {
            let mut current: Vec<IndexFile> = vec![];
            let mut size = 0u64;
            for f in group {
                if !current.is_empty() && size + f.size > self.config.compaction_max_file_size {
                    batches.push(std::mem::take(&mut current));
                    size = 0;
                }
                size += f.size;
                current.push(f.clone());
            }
            batches.push(current);
        }
        batches.retain(|b| b.len() > 1);
        batches
    }
}
