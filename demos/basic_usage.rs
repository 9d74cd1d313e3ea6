//! 端到端示例：建表写入、追加、采样、范围查询、宣告复制与 compaction
//!
//! 运行：cargo run --example basic_usage

use otree_index::common::ColumnType;
use otree_index::meta::{ColumnSchema, TableSchema};
use otree_index::query::{col, lit};
use otree_index::{IndexOptions, Result, Row, TableCatalog, TableId, Value};

fn events(range: std::ops::Range<i64>) -> Vec<Row> {
    range.map(|i| vec![
        Value::Int64(i),
        Value::Float64((i % 97) as f64 * 1.5),
        Value::str(if i % 3 == 0 { "mobile" } else { "web" }),
    ]).collect()
}

fn main() -> Result<()> {
    let schema = TableSchema::new(vec![
        ColumnSchema::new("user_id", ColumnType::Int64).not_null(),
        ColumnSchema::new("amount", ColumnType::Float64),
        ColumnSchema::new("channel", ColumnType::Varchar),
    ]);
    let catalog = TableCatalog::in_memory();
    let table = catalog.table(&TableId::new("/warehouse/events")?);

    // ── 首次写入：创建修订 1 ──────────────────────────────────────────────────
    let options = IndexOptions::from_pairs([
        ("columnsToIndex", "user_id,amount"),
        ("cubeSize", "500"),
    ])?;
    let report = table.save(&schema, &events(0..5_000), &options, true)?;
    println!("write #1: revision {} files {}", report.revision_id, report.files_added);

    // ── 追加：值域内沿用修订，超出值域生成新修订 ──────────────────────────────
    let report = table.save(&schema, &events(100..1_100), &IndexOptions::default(), true)?;
    println!("append in domain: revision {} (new: {})", report.revision_id, report.new_revision);
    let report = table.save(&schema, &events(9_000..9_500), &IndexOptions::default(), true)?;
    println!("append out of domain: revision {} (new: {})", report.revision_id, report.new_revision);

    // ── 索引状态 ──────────────────────────────────────────────────────────────
    let status = table.index_status(1)?;
    for cube in status.cubes().take(5) {
        println!("  cube {:<8} rows {:>5} normalized weight {:.2}",
                 cube.cube_id.to_string(), cube.element_count, cube.normalized_weight);
    }

    // ── 查询与采样 ────────────────────────────────────────────────────────────
    let total = table.query(&[], &[])?.files.len();
    let range = table.query(&[col("user_id").lt(lit(Value::Int64(200)))], &[])?.files.len();
    let sample = table.sample(0.1, &[])?.files.len();
    println!("files: all {total}, user_id < 200 → {range}, 10% sample → {sample}");

    // ── 宣告、复制与 compaction ────────────────────────────────────────────────
    let announced = table.analyze(Some(1))?;
    println!("announced {} cube(s) for replication", announced.len());
    let optimized = table.optimize(Some(1))?;
    println!("replication wrote {} file(s)", optimized.files_added);
    let compacted = table.compact(Some(1))?;
    println!("compaction: -{} +{}", compacted.files_removed, compacted.files_added);

    Ok(())
}
