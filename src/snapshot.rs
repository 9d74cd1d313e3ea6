//! 表快照：某一日志版本上所有修订及其 IndexStatus 的只读视图

use std::collections::{BTreeMap, BTreeSet};
use crate::common::{OTreeError, Result, RevisionId, TableId, STAGING_REVISION_ID};
use crate::cube::CubeId;
use crate::index::IndexStatus;
use crate::meta::IndexFile;
use crate::revision::Revision;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub table_id: TableId,
    /// 日志的提交版本
    pub version:  u64,
    statuses:     BTreeMap<RevisionId, IndexStatus>,
    files:        BTreeMap<RevisionId, BTreeMap<String, IndexFile>>,
}

impl Snapshot {
    /// 由日志内容构建；文件按 revision_id 归属，缺少修订的文件视为元数据损坏
    pub fn build(
        table_id:     TableId,
        version:      u64,
        revisions:    Vec<Revision>,
        files:        Vec<IndexFile>,
        replicated:   &BTreeMap<RevisionId, BTreeSet<CubeId>>,
    ) -> Result<Self> {
        let mut by_revision: BTreeMap<RevisionId, BTreeMap<String, IndexFile>> = BTreeMap::new();
        let known: BTreeSet<RevisionId> = revisions.iter().map(|r| r.revision_id).collect();
        for f in files {
            if !known.contains(&f.revision_id) {
                return Err(OTreeError::CorruptMetadata(
                    format!("file {} references unknown revision {}", f.path, f.revision_id)));
            }
            by_revision.entry(f.revision_id).or_default().insert(f.path.clone(), f);
        }

        let statuses = revisions.into_iter()
            .map(|r| {
                let id = r.revision_id;
                let files: Vec<IndexFile> = by_revision.get(&id)
                    .map(|m| m.values().cloned().collect())
                    .unwrap_or_default();
                let rep = replicated.get(&id).cloned().unwrap_or_default();
                (id, IndexStatus::from_files(r, &files, rep, BTreeSet::new()))
            })
            .collect();
        Ok(Self { table_id, version, statuses, files: by_revision })
    }

    pub fn empty(table_id: TableId) -> Self {
        Self { table_id, version: 0, statuses: BTreeMap::new(), files: BTreeMap::new() }
    }

    /// 尚无任何修订
    pub fn is_initial(&self) -> bool { self.statuses.is_empty() }

    pub fn latest_revision(&self) -> Option<&Revision> {
        self.statuses.values().next_back().map(|s| &s.revision)
    }

    pub fn latest_revision_id(&self) -> Option<RevisionId> {
        self.statuses.keys().next_back().copied()
    }

    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.statuses.values().map(|s| &s.revision)
    }

    pub fn revision(&self, id: RevisionId) -> Result<&Revision> {
        self.index_status(id).map(|s| &s.revision)
    }

    pub fn index_status(&self, id: RevisionId) -> Result<&IndexStatus> {
        self.statuses.get(&id).ok_or(OTreeError::RevisionNotFound(id))
    }

    pub fn index_statuses(&self) -> impl Iterator<Item = &IndexStatus> {
        self.statuses.values()
    }

    pub fn has_staging(&self) -> bool { self.statuses.contains_key(&STAGING_REVISION_ID) }

    pub fn files(&self, id: RevisionId) -> impl Iterator<Item = &IndexFile> {
        self.files.get(&id).into_iter().flat_map(|m| m.values())
    }

    pub fn file(&self, id: RevisionId, path: &str) -> Option<&IndexFile> {
        self.files.get(&id).and_then(|m| m.get(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Block;
    use crate::weight::Weight;

    fn table() -> TableId { TableId::new("/tmp/snap").unwrap() }

    fn file(path: &str, revision_id: RevisionId, dims: usize) -> IndexFile {
        IndexFile {
            path: path.into(), size: 1, revision_id, partition_values: Default::default(),
            blocks: vec![Block {
                cube: CubeId::root(dims), min_weight: Weight(0), max_weight: Weight(1),
                cube_max_weight: Weight::MAX, element_count: 2, replicated: false,
            }],
        }
    }

    #[test]
    fn groups_files_by_revision() {
        let staging = Revision::staging(table(), &[]);
        let mut r1 = Revision::staging(table(), &["x".into()]);
        r1.revision_id = 1;
        let snap = Snapshot::build(
            table(), 3, vec![staging, r1],
            vec![file("a", 0, 0), file("b", 1, 1), file("c", 1, 1)],
            &BTreeMap::new(),
        ).unwrap();
        assert!(snap.has_staging());
        assert_eq!(snap.latest_revision_id(), Some(1));
        assert_eq!(snap.files(1).count(), 2);
        assert_eq!(snap.index_status(1).unwrap().element_count(&CubeId::root(1)), 4);
        assert!(matches!(snap.revision(7), Err(OTreeError::RevisionNotFound(7))));
    }

    #[test]
    fn orphan_file_is_corrupt_metadata() {
        let err = Snapshot::build(table(), 1, vec![], vec![file("a", 2, 1)], &BTreeMap::new());
        assert!(matches!(err, Err(OTreeError::CorruptMetadata(_))));
    }
}
