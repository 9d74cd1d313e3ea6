//! 表句柄端到端：填充度、staging 转换、采样与裁剪的正确性

use std::collections::BTreeSet;
use std::sync::Arc;
use proptest::prelude::*;
use otree_index::common::{ColumnType, STAGING_REVISION_ID};
use otree_index::external::memory::{InMemoryDataWriter, InMemoryLog, LocalKeeper};
use otree_index::meta::{ColumnSchema, ExistingFile, TableSchema};
use otree_index::query::{col, lit, Expr};
use otree_index::transform::Transformation;
use otree_index::{Collaborators, CubeId, IndexOptions, IndexedTable, Row, TableId, Value, WriterConfig};

fn schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnSchema::new("id", ColumnType::Int64).not_null(),
        ColumnSchema::new("x", ColumnType::Int64),
        ColumnSchema::new("y", ColumnType::Float64),
    ])
}

fn row(id: i64, x: i64, y: f64) -> Row {
    vec![Value::Int64(id), Value::Int64(x), Value::Float64(y)]
}

fn options(cube_size: u64) -> IndexOptions {
    let size = cube_size.to_string();
    IndexOptions::from_pairs([
        ("columnsToIndex", "x,y"),
        ("cubeSize", size.as_str()),
        ("columnStats", r#"{"x_min":0,"x_max":1000,"y_min":0,"y_max":1000}"#),
    ]).unwrap()
}

/// 表句柄 + 可直接读取文件内容的写入器
fn table(name: &str) -> (IndexedTable, Arc<InMemoryDataWriter>) {
    let writer = Arc::new(InMemoryDataWriter::new());
    let parts = Collaborators {
        log:    Arc::new(InMemoryLog::new()),
        keeper: Arc::new(LocalKeeper::new()),
        writer: writer.clone(),
    };
    (IndexedTable::new(TableId::new(name).unwrap(), parts, WriterConfig::default()), writer)
}

fn ids_in(writer: &InMemoryDataWriter, paths: impl IntoIterator<Item = String>) -> BTreeSet<i64> {
    paths.into_iter()
        .flat_map(|p| writer.read_file(&p).unwrap_or_default())
        .filter_map(|r| r[0].as_i64())
        .collect()
}

#[test]
fn batch_of_cube_size_floods_the_root() {
    let (t, _) = table("/tmp/e2e/flood");
    let rows: Vec<Row> = (0..1_000).map(|i| row(i, i % 1000, (i % 37) as f64)).collect();
    t.save(&schema(), &rows, &options(1_000), true).unwrap();
    let status = t.index_status(1).unwrap();
    assert_eq!(status.len(), 1);
    let root = status.cube(&CubeId::root(2)).unwrap();
    assert_eq!(root.element_count, 1_000);
    assert!(root.is_flooded());
    assert!(root.max_weight < otree_index::Weight::MAX);
}

#[test]
fn half_full_root_has_normalized_weight_two() {
    let (t, _) = table("/tmp/e2e/half");
    let rows: Vec<Row> = (0..5_000).map(|i| row(i, i % 1000, (i % 11) as f64)).collect();
    t.save(&schema(), &rows, &options(10_000), true).unwrap();
    let status = t.index_status(1).unwrap();
    assert_eq!(status.len(), 1);
    let root = status.cube(&CubeId::root(2)).unwrap();
    assert_eq!(root.normalized_weight, 2.0);
    assert!(!root.is_flooded());
}

#[test]
fn converted_table_is_one_staging_cube() {
    let (t, _) = table("/tmp/e2e/convert");
    let files: Vec<ExistingFile> = (0..7)
        .map(|i| ExistingFile::new(&format!("/tmp/e2e/convert/part-{i}.parquet"), 1_000, 100))
        .collect();
    let cols = vec!["x".to_string(), "y".to_string()];
    t.convert(&schema(), &files, "parquet", &cols).unwrap();

    let staging = t.index_status(STAGING_REVISION_ID).unwrap();
    assert_eq!(staging.len(), 1);
    let root = staging.cube(&CubeId::root(2)).unwrap();
    assert_eq!(root.files().len(), 7);
    assert_eq!(root.element_count, 700);
    assert!(staging.revision.transformations.iter().all(|t| *t == Transformation::Empty));
    assert!(staging.revision.transformations.iter().all(|t| t.transform(&Value::Int64(123)) == 0.0));

    // staging 文件只受分区过滤影响
    let hits = t.query(&[col("x").eq(lit(Value::Int64(-5)))], &[]).unwrap();
    assert_eq!(hits.files.len(), 7);

    // 之后的索引写入进入修订 1
    let rows: Vec<Row> = (0..10).map(|i| row(i, i, 1.0)).collect();
    let report = t.save(&schema(), &rows, &options(100), true).unwrap();
    assert_eq!(report.revision_id, 1);
    assert_eq!(t.query(&[], &[]).unwrap().files.len(), 8);
}

#[test]
fn full_sample_reads_everything_and_zero_reads_nothing() {
    let (t, writer) = table("/tmp/e2e/sample");
    let rows: Vec<Row> = (0..600).map(|i| row(i, (i * 13) % 1000, (i % 50) as f64)).collect();
    t.save(&schema(), &rows, &options(40), true).unwrap();

    let all = t.sample(1.0, &[]).unwrap();
    let paths: Vec<String> = all.files.iter().map(|f| f.path.clone()).collect();
    assert_eq!(ids_in(&writer, paths).len(), 600);
    assert!(t.sample(0.0, &[]).unwrap().files.is_empty());
}

#[test]
fn partition_filters_prune_by_directory_value() {
    let writer = Arc::new(InMemoryDataWriter::with_partition_columns(&["channel"]));
    let parts = Collaborators {
        log:    Arc::new(InMemoryLog::new()),
        keeper: Arc::new(LocalKeeper::new()),
        writer: writer.clone(),
    };
    let t = IndexedTable::new(TableId::new("/tmp/e2e/part").unwrap(), parts, WriterConfig::default());
    let schema = TableSchema::new(vec![
        ColumnSchema::new("x", ColumnType::Int64),
        ColumnSchema::new("channel", ColumnType::Varchar),
    ]);
    let rows: Vec<Row> = (0..100)
        .map(|i| vec![Value::Int64(i), Value::str(if i % 2 == 0 { "web" } else { "mobile" })])
        .collect();
    let opts = IndexOptions::from_pairs([("columnsToIndex", "x"), ("cubeSize", "1000")]).unwrap();
    t.save(&schema, &rows, &opts, true).unwrap();

    let web = t.query(&[], &[col("channel").eq(lit(Value::str("web")))]).unwrap();
    assert!(!web.files.is_empty());
    assert!(web.files.iter().all(|f| f.partition_values["channel"] == "web"));
    let unknown = t.query(&[], &[col("region").eq(lit(Value::str("eu")))]).unwrap();
    assert_eq!(unknown.files.len(), t.query(&[], &[]).unwrap().files.len());
}

#[test]
fn hashed_negative_zero_matches_equality_on_zero() {
    let (t, writer) = table("/tmp/e2e/negzero");
    let rows: Vec<Row> = (0..40).map(|i| row(i, i * 20, -0.0)).collect();
    let opts = IndexOptions::from_pairs([
        ("columnsToIndex", "x,y:hashing"),
        ("cubeSize", "4"),
        ("columnStats", r#"{"x_min":0,"x_max":1000}"#),
    ]).unwrap();
    t.save(&schema(), &rows, &opts, true).unwrap();
    assert!(t.index_status(1).unwrap().len() > 1);

    let hits = t.query(&[col("y").eq(lit(Value::Float64(0.0)))], &[]).unwrap();
    let found = ids_in(&writer, hits.files.iter().map(|f| f.path.clone()));
    assert_eq!(found, (0..40).collect::<BTreeSet<i64>>());
}

fn range_filter(column: &str, lo: i64, hi: i64) -> Vec<Expr> {
    vec![col(column).gt_eq(lit(Value::Int64(lo))), col(column).lt_eq(lit(Value::Int64(hi)))]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// 满足过滤条件的每一行都出现在返回的文件中，包括根 cube 被复制之后
    #[test]
    fn pruning_never_drops_matching_rows(
        distinct in prop::collection::btree_set(0i64..1000, 50..400),
        lo in 0i64..1000,
        width in 0i64..400,
        cube_size in 4u64..24,
        replicate in any::<bool>(),
    ) {
        let xs: Vec<i64> = distinct.into_iter().collect();
        let (t, writer) = table("/tmp/e2e/prop");
        let rows: Vec<Row> = xs.iter().enumerate()
            .map(|(i, &x)| row(i as i64, x, ((x * 7) % 1000) as f64))
            .collect();
        let (first, second) = rows.split_at(rows.len() / 2);
        t.save(&schema(), first, &options(cube_size), true).unwrap();
        if replicate {
            // 同一批行再写一次：根已满，除阈值所在行外全部低于阈值，根溢出到 2 * cube_size - 1
            t.save(&schema(), first, &IndexOptions::default(), true).unwrap();
            let announced = t.analyze(Some(1)).unwrap();
            prop_assert!(announced.contains(&CubeId::root(2)));
            t.optimize(Some(1)).unwrap();
            prop_assert!(t.index_status(1).unwrap().replicated_set.contains(&CubeId::root(2)));
        }
        t.save(&schema(), second, &IndexOptions::default(), true).unwrap();

        let hi = (lo + width).min(999);
        let result = t.query(&range_filter("x", lo, hi), &[]).unwrap();
        let found = ids_in(&writer, result.files.iter().map(|f| f.path.clone()));
        for (i, &x) in xs.iter().enumerate() {
            if x >= lo && x <= hi {
                prop_assert!(found.contains(&(i as i64)), "row {} with x={} pruned", i, x);
            }
        }
        let everything = ids_in(&writer, t.query(&[], &[]).unwrap().files.into_iter().map(|f| f.path));
        prop_assert_eq!(everything.len(), xs.len());
    }

    /// 较小的采样比例读取的文件是较大比例的子集
    #[test]
    fn sampling_is_monotonic(p in 0.0f64..1.0, q in 0.0f64..1.0) {
        let (t, _) = table("/tmp/e2e/mono");
        let rows: Vec<Row> = (0..300).map(|i| row(i, (i * 31) % 1000, (i % 7) as f64)).collect();
        t.save(&schema(), &rows, &options(16), true).unwrap();
        let (small, large) = if p <= q { (p, q) } else { (q, p) };
        let a: BTreeSet<String> = t.sample(small, &[]).unwrap().files.into_iter().map(|f| f.path).collect();
        let b: BTreeSet<String> = t.sample(large, &[]).unwrap().files.into_iter().map(|f| f.path).collect();
        prop_assert!(a.is_subset(&b));
    }
}
