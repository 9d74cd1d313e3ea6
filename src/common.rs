//! 全局基础类型与错误定义

use thiserror::Error;

// ── ID 类型 ───────────────────────────────────────────────────────────────────

/// 修订号；0 保留给 staging（未索引文件）修订
pub type RevisionId = i64;

pub const STAGING_REVISION_ID: RevisionId = 0;

/// 不透明的表标识（通常是表的根路径）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TableId(String);

impl TableId {
    /// 校验并构造：不能为空，不能含空白或控制字符
    pub fn new(id: &str) -> Result<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty()
            || trimmed.len() != id.len()
            || id.chars().any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(OTreeError::InvalidTableId(id.into()));
        }
        Ok(Self(id.into()))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── 枚举 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum ColumnType {
    Int8, Int16, Int32, Int64,
    Float32, Float64,
    Varchar,
    Date,
}

impl ColumnType {
    /// 是否为可做线性归一化的有序数值类型
    pub fn is_numeric(self) -> bool { !matches!(self, Self::Varchar) }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

/// 错误分类：校验错误立即返回；并发冲突由协调器判定重试或失败；结构错误致命
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Concurrency,
    Structural,
}

#[derive(Debug, Error)]
pub enum OTreeError {
    #[error("columns to index {requested:?} do not match revision columns {existing:?}")]
    ColumnsMismatch { requested: Vec<String>, existing: Vec<String> },
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("invalid option {key}: {reason}")]
    InvalidOption { key: String, reason: String },
    #[error("unsupported conversion source format: {0}")]
    UnsupportedFormat(String),
    #[error("malformed table identifier: {0:?}")]
    InvalidTableId(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("concurrent modification on table {table} revision {revision_id}")]
    ConcurrentModification { table: TableId, revision_id: RevisionId },
    #[error("no log exists for table {0}")]
    LogNotFound(TableId),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),
    #[error("revision not found: {0}")]
    RevisionNotFound(RevisionId),
    #[error("data I/O error: {0}")]
    Io(String),
}

impl OTreeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ColumnsMismatch { .. }
            | Self::UnknownColumn(_)
            | Self::InvalidOption { .. }
            | Self::UnsupportedFormat(_)
            | Self::InvalidTableId(_)
            | Self::SchemaMismatch(_) => ErrorKind::Validation,
            Self::ConcurrentModification { .. } => ErrorKind::Concurrency,
            Self::LogNotFound(_)
            | Self::CorruptMetadata(_)
            | Self::RevisionNotFound(_)
            | Self::Io(_) => ErrorKind::Structural,
        }
    }

    pub fn is_retryable(&self) -> bool { self.kind() == ErrorKind::Concurrency }

    pub(crate) fn invalid_option(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOption { key: key.into(), reason: reason.into() }
    }
}

impl From<serde_json::Error> for OTreeError {
    fn from(e: serde_json::Error) -> Self { Self::CorruptMetadata(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, OTreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_id_rejects_blank_and_whitespace() {
        assert!(TableId::new("s3://bucket/events").is_ok());
        assert!(matches!(TableId::new(""), Err(OTreeError::InvalidTableId(_))));
        assert!(TableId::new(" /tmp/t").is_err());
        assert!(TableId::new("/tmp/a b").is_err());
    }

    #[test]
    fn only_concurrent_modification_is_retryable() {
        let t = TableId::new("/tmp/t").unwrap();
        let cme = OTreeError::ConcurrentModification { table: t.clone(), revision_id: 1 };
        assert!(cme.is_retryable());
        assert_eq!(OTreeError::LogNotFound(t).kind(), ErrorKind::Structural);
        assert_eq!(OTreeError::UnsupportedFormat("csv".into()).kind(), ErrorKind::Validation);
        assert!(!OTreeError::CorruptMetadata("x".into()).is_retryable());
    }
}
