use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use headcount::ledger::OccupancyLedger;
use headcount::store::WalStore;
use ulid::Ulid;

const BUILDINGS: usize = 10;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn building(i: usize) -> String {
    format!("BLDG-{i:02}")
}

async fn setup() -> (Arc<WalStore>, Arc<OccupancyLedger>) {
    let dir = std::env::temp_dir().join(format!("headcount_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(WalStore::open(dir.join("occupancy.wal")).unwrap());
    let ledger = Arc::new(OccupancyLedger::new(store.clone()));
    for i in 0..BUILDINGS {
        ledger
            .register_building(&building(i), &format!("Department {i}"))
            .await
            .unwrap();
    }
    println!("  registered {BUILDINGS} buildings in {}", dir.display());
    (store, ledger)
}

async fn phase1_sequential(ledger: &OccupancyLedger) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let direction = if i % 3 == 2 { "OUT" } else { "IN" };
        let t = Instant::now();
        ledger
            .scan(&building(0), direction, format!("tag-{i}"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} scans in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("scan latency", &mut latencies);
}

async fn phase2_hot_building(ledger: &Arc<OccupancyLedger>) {
    let n_tasks = 50;
    let n_per_task = 40;
    let target = building(1);
    let before = ledger.get_building(&target).await.unwrap().occupancy_count;

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let ledger = ledger.clone();
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                ledger
                    .scan(&target, "IN", format!("tag-{t}-{j}"))
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let after = ledger.get_building(&target).await.unwrap().occupancy_count;
    println!(
        "  {n_tasks} tasks x {n_per_task} scans on one building = {total} in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!("  count {before} -> {after} (lost updates: {})", before + total as u64 - after);
}

async fn phase3_spread(ledger: &Arc<OccupancyLedger>) {
    let n_tasks = 50;
    let n_per_task = 40;

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let target = building(2 + t % (BUILDINGS - 2));
            for j in 0..n_per_task {
                let direction = if j % 2 == 0 { "IN" } else { "OUT" };
                ledger
                    .apply_event(&target, direction, 3, None)
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} counts across {} buildings = {total} in {:.2}s = {:.0} ops/sec",
        BUILDINGS - 2,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

async fn phase4_read_under_load(ledger: &Arc<OccupancyLedger>) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let ledger = ledger.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let target = building(w);
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let direction = if i % 2 == 0 { "IN" } else { "OUT" };
                let _ = ledger.scan(&target, direction, format!("w{w}-{i}")).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let ledger = ledger.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut building_latencies = Vec::with_capacity(reads_per_reader);
            let mut log_latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                ledger.get_building(&building((r + i) % BUILDINGS)).await.unwrap();
                building_latencies.push(t.elapsed());

                let t = Instant::now();
                ledger.list_events(Some(100)).await.unwrap();
                log_latencies.push(t.elapsed());
            }
            (building_latencies, log_latencies)
        }));
    }

    let mut building_latencies = Vec::new();
    let mut log_latencies = Vec::new();
    for h in reader_handles {
        let (b, l) = h.await.unwrap();
        building_latencies.extend(b);
        log_latencies.extend(l);
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("get building", &mut building_latencies);
    print_latency("recent logs (100)", &mut log_latencies);
}

async fn phase5_compaction(store: &WalStore) {
    let pending = store.appends_since_compact().await;
    let t = Instant::now();
    store.compact().await.unwrap();
    println!(
        "  compacted {pending} appends in {:.2}ms",
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== headcount stress benchmark ===\n");

    println!("[setup]");
    let (store, ledger) = setup().await;

    println!("\n[phase 1] sequential scan throughput");
    phase1_sequential(&ledger).await;

    println!("\n[phase 2] concurrent scans on one building");
    phase2_hot_building(&ledger).await;

    println!("\n[phase 3] concurrent counts across buildings");
    phase3_spread(&ledger).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&ledger).await;

    println!("\n[phase 5] compaction");
    phase5_compaction(&store).await;

    println!("\n=== done ===");
}
