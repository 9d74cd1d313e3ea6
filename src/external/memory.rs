//! 进程内协作方：事务日志、协调服务与数据写入器
//!
//! 日志持久化布局（每表）：
//! - revision_id → 帧化的 JSON 修订
//! - revision_id → 帧化的已复制 cube 路径串列表
//! - 最新修订号、文件集合与提交历史
//!
//! 帧格式：crc32 (u32 LE) | 载荷长度 (u32 LE) | 载荷；校验失败即元数据损坏。

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, warn};
use crate::builder::TableChanges;
use crate::common::{OTreeError, Result, RevisionId, TableId};
use crate::config::IndexOptions;
use crate::cube::CubeId;
use crate::field_type::{Row, Value};
use crate::meta::{Block, IndexFile, TableSchema};
use crate::partition::DEFAULT_PARTITION;
use crate::revision::Revision;
use crate::snapshot::Snapshot;
use crate::weight::Weight;
use super::{DataWriter, FileAction, Keeper, MetadataLog, Producer, WriteLease};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ── 记录帧 ────────────────────────────────────────────────────────────────────

const FRAME_HEADER: usize = 8;

fn corrupt(msg: &str) -> OTreeError { OTreeError::CorruptMetadata(msg.into()) }

fn io_err(e: std::io::Error) -> OTreeError { OTreeError::Io(e.to_string()) }

fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| OTreeError::Io("metadata record too large".into()))?;
    let mut out = Vec::with_capacity(FRAME_HEADER + payload.len());
    out.write_u32::<LittleEndian>(crc32fast::hash(payload)).map_err(io_err)?;
    out.write_u32::<LittleEndian>(len).map_err(io_err)?;
    out.extend_from_slice(payload);
    Ok(out)
}

fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
    let mut cursor = Cursor::new(frame);
    let crc = cursor.read_u32::<LittleEndian>().map_err(|_| corrupt("truncated record header"))?;
    let len = cursor.read_u32::<LittleEndian>().map_err(|_| corrupt("truncated record header"))?;
    let payload = frame.get(FRAME_HEADER..)
        .filter(|p| p.len() == len as usize)
        .ok_or_else(|| corrupt("record length mismatch"))?;
    if crc32fast::hash(payload) != crc {
        return Err(corrupt("record checksum mismatch"));
    }
    Ok(payload)
}

fn encode_replicated(set: &BTreeSet<CubeId>) -> Result<Vec<u8>> {
    let paths: Vec<String> = set.iter().map(CubeId::to_path_string).collect();
    encode_frame(&serde_json::to_vec(&paths)?)
}

// ── 事务日志 ──────────────────────────────────────────────────────────────────

/// 一次提交的摘要
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub version:         u64,
    pub revision_id:     RevisionId,
    pub append:          bool,
    pub indexed_columns: Vec<String>,
    pub added:           usize,
    pub removed:         usize,
    /// 修订或复制集合是否变化
    pub metadata_change: bool,
}

struct TableLog {
    schema:           TableSchema,
    /// 每次提交加一
    version:          u64,
    /// 仅在修订、复制集合变化或覆盖写时加一
    metadata_version: u64,
    revisions:        BTreeMap<RevisionId, Vec<u8>>,
    replicated:       BTreeMap<RevisionId, Vec<u8>>,
    last_revision_id: Option<RevisionId>,
    files:            BTreeMap<String, IndexFile>,
    /// 文件路径 → 加入时的提交版本
    added_at:         HashMap<String, u64>,
    history:          Vec<CommitInfo>,
}

impl TableLog {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            version:          0,
            metadata_version: 0,
            revisions:        BTreeMap::new(),
            replicated:       BTreeMap::new(),
            last_revision_id: None,
            files:            BTreeMap::new(),
            added_at:         HashMap::new(),
            history:          vec![],
        }
    }

    fn revision(&self, id: RevisionId) -> Result<Revision> {
        let raw = self.revisions.get(&id).ok_or(OTreeError::RevisionNotFound(id))?;
        Ok(serde_json::from_slice(decode_frame(raw)?)?)
    }

    fn replicated_set(&self, id: RevisionId, dimensions: usize) -> Result<BTreeSet<CubeId>> {
        let Some(raw) = self.replicated.get(&id) else { return Ok(BTreeSet::new()) };
        let paths: Vec<String> = serde_json::from_slice(decode_frame(raw)?)?;
        paths.iter().map(|p| CubeId::from_path_string(dimensions, p)).collect()
    }

    /// `read_version` 之后是否有提交改变了元数据
    fn metadata_changed_since(&self, read_version: u64) -> bool {
        self.history.iter().rev()
            .take_while(|c| c.version > read_version)
            .any(|c| c.metadata_change)
    }

    /// `read_version` 之后加入、且在 `cubes` 中持有自身数据的文件
    fn newer_files_in(&self, revision_id: RevisionId, cubes: &BTreeSet<CubeId>, read_version: u64) -> Vec<&str> {
        self.files.values()
            .filter(|f| f.revision_id == revision_id)
            .filter(|f| self.added_at.get(&f.path).map_or(false, |&v| v > read_version))
            .filter(|f| f.blocks.iter().any(|b| !b.replicated && cubes.contains(&b.cube)))
            .map(|f| f.path.as_str())
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryLog {
    tables: RwLock<HashMap<TableId, TableLog>>,
}

impl InMemoryLog {
    pub fn new() -> Self { Self::default() }

    pub fn history(&self, table: &TableId) -> Vec<CommitInfo> {
        read(&self.tables).get(table).map(|l| l.history.clone()).unwrap_or_default()
    }

    /// 当前提交版本，与 `Snapshot::version` 一致
    pub fn version(&self, table: &TableId) -> Option<u64> {
        read(&self.tables).get(table).map(|l| l.version)
    }

    pub fn metadata_version(&self, table: &TableId) -> Option<u64> {
        read(&self.tables).get(table).map(|l| l.metadata_version)
    }

    pub fn last_revision_id(&self, table: &TableId) -> Option<RevisionId> {
        read(&self.tables).get(table).and_then(|l| l.last_revision_id)
    }

    fn not_found(table: &TableId) -> OTreeError { OTreeError::LogNotFound(table.clone()) }
}

impl MetadataLog for InMemoryLog {
    fn exists_log(&self, table: &TableId) -> bool {
        read(&self.tables).contains_key(table)
    }

    fn create_log(&self, table: &TableId, schema: &TableSchema) -> Result<()> {
        let mut tables = write(&self.tables);
        if !tables.contains_key(table) {
            info!(table = %table, columns = schema.num_columns(), "created table log");
            tables.insert(table.clone(), TableLog::new(schema.clone()));
        }
        Ok(())
    }

    fn load_snapshot(&self, table: &TableId) -> Result<Snapshot> {
        let tables = read(&self.tables);
        let log = tables.get(table).ok_or_else(|| Self::not_found(table))?;
        let revisions = log.revisions.keys()
            .map(|&id| log.revision(id))
            .collect::<Result<Vec<_>>>()?;
        let mut replicated = BTreeMap::new();
        for r in &revisions {
            let set = log.replicated_set(r.revision_id, r.dimension_count())?;
            if !set.is_empty() {
                replicated.insert(r.revision_id, set);
            }
        }
        Snapshot::build(table.clone(), log.version, revisions, log.files.values().cloned().collect(), &replicated)
    }

    fn load_current_schema(&self, table: &TableId) -> Result<TableSchema> {
        read(&self.tables).get(table)
            .map(|l| l.schema.clone())
            .ok_or_else(|| Self::not_found(table))
    }

    fn update_with_transaction(
        &self,
        table:    &TableId,
        schema:   &TableSchema,
        options:  &IndexOptions,
        append:       bool,
        read_version: u64,
        producer:     &mut Producer<'_>,
    ) -> Result<()> {
        if !self.exists_log(table) {
            return Err(Self::not_found(table));
        }

        // 生产者在锁外运行
        let (changes, actions) = producer()?;
        let revision_id = changes.revision().revision_id;

        let mut tables = write(&self.tables);
        let log = tables.get_mut(table).ok_or_else(|| Self::not_found(table))?;
        if log.metadata_changed_since(read_version) {
            warn!(table = %table, revision_id, read_version, found = log.version,
                  "metadata changed since snapshot");
            return Err(OTreeError::ConcurrentModification { table: table.clone(), revision_id });
        }
        // 复制只覆盖快照中的数据；之后写入这些 cube 的文件没有副本
        let unreplicated = log.newer_files_in(revision_id, &changes.replicated_cubes, read_version);
        if !unreplicated.is_empty() {
            warn!(table = %table, revision_id, read_version, files = unreplicated.len(),
                  "replicated cubes received data after snapshot");
            return Err(OTreeError::ConcurrentModification { table: table.clone(), revision_id });
        }
        if append && log.schema != *schema {
            return Err(OTreeError::SchemaMismatch(format!("append schema differs from table {table}")));
        }
        let vanished = actions.iter().any(|a| matches!(a, FileAction::Remove(p) if !log.files.contains_key(p)));
        if append && vanished {
            warn!(table = %table, revision_id, "removed file no longer present");
            return Err(OTreeError::ConcurrentModification { table: table.clone(), revision_id });
        }

        // 先编码，失败时日志保持不变
        let revision_frame = changes.revision_change.as_ref()
            .map(|r| Ok::<_, OTreeError>((r.revision_id, encode_frame(&serde_json::to_vec(r)?)?)))
            .transpose()?;
        let replicated_frame = if changes.replicated_cubes.is_empty() {
            None
        } else {
            let mut set = log.replicated_set(revision_id, changes.revision().dimension_count())?;
            set.extend(changes.replicated_cubes.iter().cloned());
            Some(encode_replicated(&set)?)
        };
        let metadata_change = revision_frame.is_some() || replicated_frame.is_some() || !append;

        if !append {
            log.files.clear();
            log.added_at.clear();
            log.schema = schema.clone();
        }
        if let Some((id, frame)) = revision_frame {
            log.revisions.insert(id, frame);
            log.last_revision_id = log.last_revision_id.max(Some(id));
        }
        if let Some(frame) = replicated_frame {
            log.replicated.insert(revision_id, frame);
        }
        log.version += 1;
        let (mut added, mut removed) = (0, 0);
        for action in actions {
            match action {
                FileAction::Add(f) => {
                    log.added_at.insert(f.path.clone(), log.version);
                    log.files.insert(f.path.clone(), f);
                    added += 1;
                }
                FileAction::Remove(p) => {
                    log.added_at.remove(&p);
                    log.files.remove(&p);
                    removed += 1;
                }
            }
        }
        if metadata_change {
            log.metadata_version += 1;
        }
        log.history.push(CommitInfo {
            version: log.version,
            revision_id,
            append,
            indexed_columns: options.column_names(),
            added,
            removed,
            metadata_change,
        });
        info!(table = %table, version = log.version, revision_id, added, removed,
              metadata_change, "committed transaction");
        Ok(())
    }

    fn has_conflicts(
        &self,
        table:           &TableId,
        revision_id:     RevisionId,
        known_announced: &BTreeSet<CubeId>,
        old_replicated:  &BTreeSet<CubeId>,
    ) -> Result<bool> {
        let tables = read(&self.tables);
        let log = tables.get(table).ok_or_else(|| Self::not_found(table))?;
        if !log.revisions.contains_key(&revision_id) {
            return Ok(false);
        }
        let dims = log.revision(revision_id)?.dimension_count();
        let current = log.replicated_set(revision_id, dims)?;
        let unexpected: Vec<&CubeId> = current.difference(old_replicated)
            .filter(|c| !known_announced.contains(*c))
            .collect();
        if !unexpected.is_empty() {
            debug!(table = %table, revision_id, cubes = unexpected.len(),
                   "replicated cubes were not announced to this writer");
        }
        Ok(!unexpected.is_empty())
    }
}

// ── 协调服务 ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct KeeperEntry {
    announced: BTreeSet<CubeId>,
    active:    BTreeSet<u64>,
}

/// 单进程协调服务：临界区只覆盖宣告集合与租约记账
#[derive(Default)]
pub struct LocalKeeper {
    entries:    Mutex<HashMap<(TableId, RevisionId), KeeperEntry>>,
    next_lease: AtomicU64,
}

impl LocalKeeper {
    pub fn new() -> Self { Self::default() }

    pub fn active_writes(&self, table: &TableId, revision_id: RevisionId) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
            .get(&(table.clone(), revision_id))
            .map_or(0, |e| e.active.len())
    }
}

impl Keeper for LocalKeeper {
    fn begin_write(&self, table: &TableId, revision_id: RevisionId) -> WriteLease {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry((table.clone(), revision_id)).or_default();
        entry.active.insert(id);
        WriteLease { table: table.clone(), revision_id, id, announced: entry.announced.clone() }
    }

    fn end_write(&self, lease: WriteLease) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&(lease.table, lease.revision_id)) {
            entry.active.remove(&lease.id);
        }
    }

    fn announce(&self, table: &TableId, revision_id: RevisionId, cubes: &BTreeSet<CubeId>) {
        if cubes.is_empty() { return; }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry((table.clone(), revision_id)).or_default()
            .announced.extend(cubes.iter().cloned());
        info!(table = %table, revision_id, cubes = cubes.len(), "announced cubes for replication");
    }

    fn announced(&self, table: &TableId, revision_id: RevisionId) -> BTreeSet<CubeId> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
            .get(&(table.clone(), revision_id))
            .map(|e| e.announced.clone())
            .unwrap_or_default()
    }

    fn finish_replication(&self, table: &TableId, revision_id: RevisionId, cubes: &BTreeSet<CubeId>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&(table.clone(), revision_id)) {
            entry.announced.retain(|c| !cubes.contains(c));
        }
    }
}

// ── 数据写入器 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredBlock {
    block: Block,
    rows:  Vec<Row>,
}

/// 文件内容保存在内存中；按 (分区, cube, 是否副本) 每组写一个文件
#[derive(Default)]
pub struct InMemoryDataWriter {
    partition_columns: Vec<String>,
    files:             RwLock<HashMap<String, Vec<StoredBlock>>>,
    next_file:         AtomicU64,
}

fn estimated_size(rows: &[Row]) -> u64 {
    rows.iter().flatten().map(|v| v.to_sort_key().len() as u64 + 1).sum()
}

fn partition_string(v: &Value) -> String {
    if v.is_null() { DEFAULT_PARTITION.to_string() } else { v.to_string() }
}

impl InMemoryDataWriter {
    pub fn new() -> Self { Self::default() }

    /// 按这些列做目录分区
    pub fn with_partition_columns(columns: &[&str]) -> Self {
        Self { partition_columns: columns.iter().map(|c| c.to_string()).collect(), ..Self::default() }
    }

    pub fn file_count(&self) -> usize { read(&self.files).len() }

    /// 文件中的全部行（含副本）
    pub fn read_file(&self, path: &str) -> Option<Vec<Row>> {
        read(&self.files).get(path)
            .map(|blocks| blocks.iter().flat_map(|b| b.rows.iter().cloned()).collect())
    }

    fn partition_of(&self, schema: &TableSchema, row: &Row) -> Result<BTreeMap<String, String>> {
        self.partition_columns.iter()
            .map(|c| {
                let idx = schema.column_index(c)
                    .ok_or_else(|| OTreeError::SchemaMismatch(format!("partition column {c} missing from schema")))?;
                Ok((c.clone(), row.get(idx).map_or_else(|| DEFAULT_PARTITION.to_string(), partition_string)))
            })
            .collect()
    }

    fn store(
        &self,
        table:            &TableId,
        revision_id:      RevisionId,
        partition_values: BTreeMap<String, String>,
        blocks:           Vec<StoredBlock>,
    ) -> IndexFile {
        let n = self.next_file.fetch_add(1, Ordering::Relaxed);
        let path = format!("{table}/r{revision_id}/part-{n:06}.bin");
        let file = IndexFile {
            path:             path.clone(),
            size:             blocks.iter().map(|b| estimated_size(&b.rows)).sum(),
            revision_id,
            partition_values,
            blocks:           blocks.iter().map(|b| b.block.clone()).collect(),
        };
        write(&self.files).insert(path, blocks);
        file
    }
}

type GroupKey = (BTreeMap<String, String>, CubeId, bool);

impl DataWriter for InMemoryDataWriter {
    fn write(
        &self,
        table:   &TableId,
        schema:  &TableSchema,
        rows:    &[Row],
        changes: &TableChanges,
    ) -> Result<Vec<IndexFile>> {
        let revision_id = changes.revision().revision_id;
        let mut groups: BTreeMap<GroupKey, Vec<(Weight, &Row)>> = BTreeMap::new();
        for a in &changes.assignments {
            let row = rows.get(a.row)
                .ok_or_else(|| OTreeError::Io(format!("assignment references missing row {}", a.row)))?;
            let pv = self.partition_of(schema, row)?;
            groups.entry((pv, a.cube.clone(), a.replicated)).or_default().push((a.weight, row));
        }

        let files: Vec<IndexFile> = groups.into_iter()
            .map(|((pv, cube, replicated), members)| {
                let (lo, hi) = members.iter()
                    .fold((Weight::MAX, Weight::MIN), |(lo, hi), (w, _)| (lo.min(*w), hi.max(*w)));
                let block = Block {
                    cube_max_weight: if replicated { Weight::MAX } else { changes.cube_max_weight(&cube) },
                    cube,
                    min_weight:      lo,
                    max_weight:      hi,
                    element_count:   members.len() as u64,
                    replicated,
                };
                let rows = members.into_iter().map(|(_, r)| r.clone()).collect();
                self.store(table, revision_id, pv, vec![StoredBlock { block, rows }])
            })
            .collect();
        debug!(table = %table, revision_id, files = files.len(), "wrote data files");
        Ok(files)
    }

    fn compact(
        &self,
        table:       &TableId,
        revision_id: RevisionId,
        files:       &[IndexFile],
    ) -> Result<Vec<IndexFile>> {
        let mut groups: BTreeMap<BTreeMap<String, String>, BTreeMap<(CubeId, bool), StoredBlock>> = BTreeMap::new();
        {
            let stored = read(&self.files);
            for f in files {
                let blocks = stored.get(&f.path)
                    .ok_or_else(|| OTreeError::Io(format!("missing data file {}", f.path)))?;
                let group = groups.entry(f.partition_values.clone()).or_default();
                for sb in blocks {
                    match group.entry((sb.block.cube.clone(), sb.block.replicated)) {
                        Entry::Vacant(e) => { e.insert(sb.clone()); }
                        Entry::Occupied(mut e) => {
                            let merged = e.get_mut();
                            merged.block = merged.block.merge(&sb.block);
                            merged.rows.extend(sb.rows.iter().cloned());
                        }
                    }
                }
            }
        }
        let out: Vec<IndexFile> = groups.into_iter()
            .map(|(pv, blocks)| self.store(table, revision_id, pv, blocks.into_values().collect()))
            .collect();
        debug!(table = %table, revision_id, inputs = files.len(), outputs = out.len(), "compacted files");
        Ok(out)
    }

    fn read_cube(&self, _table: &TableId, files: &[IndexFile], cube: &CubeId) -> Result<Vec<Row>> {
        let stored = read(&self.files);
        let mut rows = vec![];
        for f in files {
            let blocks = stored.get(&f.path)
                .ok_or_else(|| OTreeError::Io(format!("missing data file {}", f.path)))?;
            blocks.iter()
                .filter(|b| b.block.cube == *cube && !b.block.replicated)
                .for_each(|b| rows.extend(b.rows.iter().cloned()));
        }
        Ok(rows)
    }
}
