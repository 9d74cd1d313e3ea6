//! # otree-index
//!
//! 建立在外部事务日志之上的自适应多维索引（OTree）：
//! - **寻址层**：归一化空间的层次划分（CubeId）、列变换与修订
//! - **索引层**：每修订一份 IndexStatus，行按权重分配到 cube，文件带 cube 标签
//! - **查询层**：由过滤条件提取查询空间与权重区间，深度优先裁剪文件
//! - **写入层**：乐观并发的写入状态机，宣告/复制冲突判定与有界重试
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  TableCatalog / IndexedTable                 │
//! │        (缓存 Snapshot，写入/维护后失效)                       │
//! │   ┌──────────────────────┐      ┌─────────────────────────┐  │
//! │   │   WriteCoordinator   │      │     QueryExecutor       │  │
//! │   │ START → COMPUTE →    │      │  QuerySpec (空间+权重)  │  │
//! │   │ WRITE → COMMIT       │      │  DFS 裁剪 + 分区过滤    │  │
//! │   └──────────┬───────────┘      └────────────┬────────────┘  │
//! │              │                               │               │
//! │        IndexBuilder                      Snapshot            │
//! │   (权重排序、阈值、传播)           Revision → IndexStatus      │
//! │              │                        CubeStatus / Block     │
//! │   Revision ── Transformer / Transformation ── CubeId         │
//! │                                                              │
//! │  外部协作方契约：MetadataLog · Keeper · DataWriter            │
//! │  （进程内实现：InMemoryLog · LocalKeeper · InMemoryDataWriter）│
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 基础类型 ──────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod field_type;
pub mod meta;
pub mod weight;

// ── 寻址与修订 ────────────────────────────────────────────────────────────────
pub mod cube;
pub mod transform;
pub mod revision;

// ── 索引与查询 ────────────────────────────────────────────────────────────────
pub mod index;
pub mod builder;
pub mod partition;
pub mod query;
pub mod snapshot;

// ── 写入与表句柄 ──────────────────────────────────────────────────────────────
pub mod external;
pub mod coordinator;
pub mod table;

pub use common::{ErrorKind, OTreeError, Result, RevisionId, TableId};
pub use config::{IndexOptions, WriterConfig};
pub use cube::CubeId;
pub use field_type::{Row, Value};
pub use table::{Collaborators, IndexedTable, TableCatalog};
pub use weight::{Weight, WeightRange};
