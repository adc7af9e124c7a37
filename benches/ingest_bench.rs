//! Benchmarks for row normalization, file import and the cache
//!
//! Run with: cargo bench

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use csv::StringRecord;
use stationflow::aggregation::compute_buckets;
use stationflow::cache::{CacheConfig, IntelligentCache, SetOptions};
use stationflow::ingest::{ColumnConfig, ProcessorConfig, RowContext, RowProcessor, RowSchema};
use stationflow::storage::{Granularity, MeasurementRecord, MeasurementStore};
use std::sync::Arc;
use tempfile::tempdir;

fn create_rows(count: usize) -> Vec<StringRecord> {
    (0..count)
        .map(|i| {
            let secs = i % 86_400;
            StringRecord::from(vec![
                "09.03.2024".to_string(),
                format!("{}:{}:{}", secs / 3600, (secs / 60) % 60, secs % 60),
                format!("{},{}", 40 + i % 30, i % 10),
            ])
        })
        .collect()
}

fn create_file(dir: &std::path::Path, rows: usize) -> std::path::PathBuf {
    let mut content = String::from("Datum;Systemzeit;LAeq\n");
    for row in create_rows(rows) {
        content.push_str(&format!("{};{};{}\n", &row[0], &row[1], &row[2]));
    }
    let path = dir.join("bench.csv");
    std::fs::write(&path, content).unwrap();
    path
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    let headers = StringRecord::from(vec!["Datum", "Systemzeit", "LAeq"]);
    let schema = RowSchema::from_headers(&headers, &ColumnConfig::default());
    let ctx = RowContext {
        station: "bench".to_string(),
        source_file: "bench.csv".to_string(),
        fallback_date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
    };

    for size in [100, 1000, 10000] {
        let rows = create_rows(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("rows_{}", size), |b| {
            b.iter(|| {
                for row in &rows {
                    black_box(schema.normalize(black_box(row), &ctx).unwrap());
                }
            })
        });
    }

    group.finish();
}

fn bench_import(c: &mut Criterion) {
    let mut group = c.benchmark_group("import");
    group.sample_size(10);
    group.throughput(Throughput::Elements(5000));

    group.bench_function("file_5000_rows", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let path = create_file(dir.path(), 5000);
                let store = Arc::new(MeasurementStore::open(dir.path().join("bench.db")).unwrap());
                (dir, path, RowProcessor::new(store, ProcessorConfig::default()))
            },
            |(_dir, path, processor)| processor.process_file("bench", &path).unwrap(),
        )
    });

    group.finish();
}

fn bench_buckets(c: &mut Criterion) {
    let start = NaiveDate::from_ymd_opt(2024, 3, 9)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let records: Vec<MeasurementRecord> = (0..86_400i64)
        .step_by(10)
        .map(|s| MeasurementRecord::new("bench", start + chrono::Duration::seconds(s), 50.0))
        .collect();

    c.bench_function("compute_buckets_day_15min", |b| {
        b.iter(|| compute_buckets(black_box(&records), Granularity::FifteenMinutes, &[]))
    });
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    let dir = tempdir().unwrap();
    let cache = IntelligentCache::open(CacheConfig::with_dir(dir.path().join("cache"))).unwrap();
    let value = serde_json::json!({"station": "bench", "avg": 52.4, "buckets": (0..24).collect::<Vec<_>>()});

    group.bench_function("set_memory", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            cache
                .set(&format!("agg:hourly:{}", i % 500), &value, SetOptions::new().tag("station_bench"))
                .unwrap()
        })
    });

    cache.set("agg:hourly:hot", &value, SetOptions::new()).unwrap();
    group.bench_function("get_memory_hit", |b| {
        b.iter(|| cache.get(black_box("agg:hourly:hot")).unwrap())
    });

    cache
        .set("history:bench", &value, SetOptions::new().persist())
        .unwrap();
    group.bench_function("set_persisted", |b| {
        b.iter(|| {
            cache
                .set("history:bench", &value, SetOptions::new().persist())
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_normalize, bench_import, bench_buckets, bench_cache);
criterion_main!(benches);
