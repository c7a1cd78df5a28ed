use std::path::PathBuf;
use std::sync::Arc;

use shardflow::db::{ConnectionProvider, FieldType, SchemaService, SqlBuilder};
use shardflow::testing::MemoryDb;
use shardflow::{
    Command, Engine, ExportConfig, FileSplitPolicy, ImportConfig, MergeMode, OrderSpec, QuoteMode,
};

fn engine_for(db: &MemoryDb) -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let provider: Arc<dyn ConnectionProvider> = Arc::new(db.clone());
    let schema: Arc<dyn SchemaService> = Arc::new(db.clone());
    let builder: Arc<dyn SqlBuilder> = Arc::new(db.sql_builder());
    Engine::new(provider, schema, builder)
}

fn seeded_orders(shards: usize, rows_per_shard: usize) -> MemoryDb {
    let db = MemoryDb::new();
    db.create_table(
        "orders",
        &[("id", FieldType::Numeric), ("note", FieldType::String)],
        shards,
        1,
        None,
    );
    let mut id = 0;
    for shard in 0..shards {
        for _ in 0..rows_per_shard {
            db.push_row(
                "orders",
                shard,
                vec![Some(id.to_string()), Some(format!("note-{id}"))],
            );
            id += 1;
        }
    }
    db
}

fn export_files(report: &shardflow::RunReport) -> Vec<PathBuf> {
    report.outcomes[0].result.as_ref().unwrap().clone()
}

fn read_all_lines(files: &[PathBuf]) -> Vec<String> {
    let mut lines = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(file).unwrap();
        lines.extend(text.lines().map(str::to_string));
    }
    lines
}

#[test]
fn per_shard_export_covers_every_row() -> anyhow::Result<()> {
    let db = seeded_orders(4, 25);
    let dir = tempfile::tempdir()?;
    let mut config = ExportConfig::new(dir.path().join("orders").display().to_string());
    config.quote = QuoteMode::None;

    let report = engine_for(&db).run(&Command::Export {
        tables: vec!["orders".into()],
        config,
    });
    assert!(report.is_success(), "{:?}", report.first_error());

    let files = export_files(&report);
    assert_eq!(files.len(), 4);
    let mut lines = read_all_lines(&files);
    lines.sort();
    lines.dedup();
    assert_eq!(lines.len(), 100);
    Ok(())
}

#[test]
fn fixed_file_count_export_produces_exactly_that_many_files() -> anyhow::Result<()> {
    let db = seeded_orders(3, 40);
    let dir = tempfile::tempdir()?;
    let mut config = ExportConfig::new(dir.path().join("orders").display().to_string());
    config.quote = QuoteMode::None;
    config.split = FileSplitPolicy::FixedCount(2);
    config.batch_size = 16;

    let report = engine_for(&db).run(&Command::Export {
        tables: vec!["orders".into()],
        config,
    });
    assert!(report.is_success(), "{:?}", report.first_error());

    let files = export_files(&report);
    assert!(files.len() <= 2);
    let lines = read_all_lines(&files);
    assert_eq!(lines.len(), 120);
    Ok(())
}

#[test]
fn ordered_export_is_globally_sorted() -> anyhow::Result<()> {
    let db = MemoryDb::new();
    db.create_table("events", &[("ts", FieldType::Numeric)], 3, 1, None);
    for (shard, base) in [(0usize, 0i64), (1, 1), (2, 2)] {
        for step in 0..20 {
            db.push_row("events", shard, vec![Some((base + step * 3).to_string())]);
        }
    }
    let dir = tempfile::tempdir()?;
    let mut config = ExportConfig::new(dir.path().join("events").display().to_string());
    config.quote = QuoteMode::None;
    config.order_by = Some(OrderSpec {
        columns: vec!["ts".into()],
        descending: false,
        merge: MergeMode::Streaming,
    });

    let report = engine_for(&db).run(&Command::Export {
        tables: vec!["events".into()],
        config,
    });
    assert!(report.is_success(), "{:?}", report.first_error());

    let timestamps: Vec<i64> = read_all_lines(&export_files(&report))
        .iter()
        .map(|l| l.parse().unwrap())
        .collect();
    assert_eq!(timestamps, (0..60).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn multi_table_export_prefixes_files_per_table() -> anyhow::Result<()> {
    let db = seeded_orders(2, 5);
    db.create_table("users", &[("id", FieldType::Numeric)], 2, 1, None);
    db.push_row("users", 0, vec![Some("7".into())]);
    let dir = tempfile::tempdir()?;
    let mut config = ExportConfig::new(dir.path().join("dump").display().to_string());
    config.quote = QuoteMode::None;

    let report = engine_for(&db).run(&Command::Export {
        tables: vec!["orders".into(), "users".into()],
        config,
    });
    assert!(report.is_success(), "{:?}", report.first_error());
    for outcome in &report.outcomes {
        for file in outcome.result.as_ref().unwrap() {
            let name = file.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(&format!("dump_{}", outcome.table)));
        }
    }
    Ok(())
}

#[test]
fn exported_files_import_back_losslessly() -> anyhow::Result<()> {
    let source = MemoryDb::new();
    source.create_table(
        "orders",
        &[("id", FieldType::Numeric), ("note", FieldType::String)],
        3,
        1,
        None,
    );
    let mut id = 0;
    for shard in 0..3 {
        for _ in 0..30 {
            // Values that exercise quoting on the way out.
            source.push_row(
                "orders",
                shard,
                vec![Some(id.to_string()), Some(format!("note,{id}"))],
            );
            id += 1;
        }
    }

    let dir = tempfile::tempdir()?;
    let mut export = ExportConfig::new(dir.path().join("orders").display().to_string());
    export.quote = QuoteMode::Auto;
    let report = engine_for(&source).run(&Command::Export {
        tables: vec!["orders".into()],
        config: export,
    });
    assert!(report.is_success(), "{:?}", report.first_error());
    let files = export_files(&report);

    let target = MemoryDb::new();
    target.create_table(
        "orders",
        &[("id", FieldType::Numeric), ("note", FieldType::String)],
        1,
        1,
        None,
    );
    let report = engine_for(&target).run(&Command::Import {
        tables: vec!["orders".into()],
        files,
        config: ImportConfig {
            producers: 2,
            consumers: 2,
            force_consumer_parallelism: true,
            ..ImportConfig::default()
        },
    });
    assert!(report.is_success(), "{:?}", report.first_error());

    let mut expected = source.all_rows("orders");
    let mut imported = target.all_rows("orders");
    expected.sort();
    imported.sort();
    assert_eq!(expected, imported);
    Ok(())
}

#[cfg(feature = "compression-gzip")]
#[test]
fn gzip_transform_round_trips_through_both_pipelines() -> anyhow::Result<()> {
    use shardflow::GzipTransform;

    let source = seeded_orders(2, 10);
    let dir = tempfile::tempdir()?;
    let mut export = ExportConfig::new(dir.path().join("orders").display().to_string());
    export.quote = QuoteMode::None;

    let transform: Arc<dyn shardflow::BlockTransform> = Arc::new(GzipTransform);
    let report = engine_for(&source)
        .with_transform(Arc::clone(&transform))
        .run(&Command::Export {
            tables: vec!["orders".into()],
            config: export,
        });
    assert!(report.is_success(), "{:?}", report.first_error());
    let files = export_files(&report);

    let target = MemoryDb::new();
    target.create_table(
        "orders",
        &[("id", FieldType::Numeric), ("note", FieldType::String)],
        1,
        1,
        None,
    );
    // Compressed blocks cannot be claimed mid-stream, so each file must be
    // read as a single block.
    let config = ImportConfig {
        producers: 2,
        consumers: 2,
        force_consumer_parallelism: true,
        block_size: 8 * 1024 * 1024,
        ..ImportConfig::default()
    };
    let report = engine_for(&target)
        .with_transform(transform)
        .run(&Command::Import {
            tables: vec!["orders".into()],
            files,
            config,
        });
    assert!(report.is_success(), "{:?}", report.first_error());
    assert_eq!(target.all_rows("orders").len(), 20);
    Ok(())
}
