//! Summary: Throughput benchmarks for thunderstream write streams.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Run with: cargo run --release --manifest-path bench/Cargo.toml --bin stream_bench

use std::sync::Arc;
use std::time::Instant;

use thunderstream::{
    Database, DatabaseOptions, Operation, StreamEvent, WriteStream, WriteStreamOptions,
};

const NUM_KEYS: usize = 100_000;
const VALUE_SIZE: usize = 100;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    println!("=== thunderstream Benchmark Suite ===");
    println!("Keys: {NUM_KEYS}, Value size: {VALUE_SIZE} bytes\n");

    bench_memory_burst().await;
    bench_log_burst().await;

    for max in [16, 256, 4096] {
        bench_backpressure(max).await;
    }

    for size in [1, 64, 1024] {
        bench_batch_size(size).await;
    }
}

fn value() -> Vec<u8> {
    vec![b'v'; VALUE_SIZE]
}

fn report(label: &str, ws: &WriteStream, start: Instant) {
    let elapsed = start.elapsed();
    let stats = ws.stats();
    let ops_per_sec = stats.ops_applied as f64 / elapsed.as_secs_f64();
    println!(
        "{label}: {:?} ({:.0} ops/sec, {} store writes, avg batch {:.1})",
        elapsed,
        ops_per_sec,
        stats.batches + stats.single_writes,
        stats.avg_batch_size()
    );
}

/// One synchronous burst of writes, then end.
async fn run_burst(db: &Arc<Database>, options: WriteStreamOptions, label: &str) {
    let ws = db.write_stream(options).expect("stream should be created");
    let value = value();

    let start = Instant::now();
    for i in 0..NUM_KEYS {
        let key = format!("key_{i:08}");
        ws.write(Operation::put(key, value.clone()))
            .expect("write should be accepted");
    }
    ws.end();
    ws.closed().await;
    report(label, &ws, start);
}

async fn bench_memory_burst() {
    let db = Database::memory();
    db.open().await.expect("open should succeed");
    run_burst(
        &db,
        WriteStreamOptions::default(),
        &format!("Memory burst ({}K puts)", NUM_KEYS / 1000),
    )
    .await;
}

async fn bench_log_burst() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let db = Database::create(dir.path().join("bench"), DatabaseOptions::default());
    db.open().await.expect("open should succeed");
    run_burst(
        &db,
        WriteStreamOptions::default(),
        &format!("Log burst ({}K puts)", NUM_KEYS / 1000),
    )
    .await;
    db.close().await.expect("close should succeed");
}

/// Producer that honours backpressure: waits for `Drain` after every `false`.
async fn bench_backpressure(max_buffer_length: usize) {
    let db = Database::memory();
    db.open().await.expect("open should succeed");
    let ws = db
        .write_stream(WriteStreamOptions::default().max_buffer_length(max_buffer_length))
        .expect("stream should be created");
    let mut events = ws.subscribe();
    let value = value();

    let start = Instant::now();
    let mut waits = 0usize;
    for i in 0..NUM_KEYS {
        let key = format!("key_{i:08}");
        let within = ws
            .write(Operation::put(key, value.clone()))
            .expect("write should be accepted");
        if !within {
            waits += 1;
            while let Some(event) = events.recv().await {
                if matches!(event, StreamEvent::Drain) {
                    break;
                }
            }
        }
    }
    ws.end();
    ws.closed().await;
    report(
        &format!("Backpressure (max {max_buffer_length}, {waits} drain waits)"),
        &ws,
        start,
    );
}

async fn bench_batch_size(max_batch_size: usize) {
    let db = Database::memory();
    db.open().await.expect("open should succeed");
    run_burst(
        &db,
        WriteStreamOptions::default().max_batch_size(max_batch_size),
        &format!("Burst with max batch {max_batch_size}"),
    )
    .await;
}
