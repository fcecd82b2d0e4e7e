use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

/// Opening hours used on every weekday: 08:00-20:00, twelve one-hour slots.
const SLOTS_PER_DAY: u32 = 12;

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    admin_password: String,
    booking_password: String,
}

impl Target {
    async fn connect(&self, user: &str) -> tokio_postgres::Client {
        let password = if user == "admin" {
            &self.admin_password
        } else {
            &self.booking_password
        };
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname("spa")
            .user(user)
            .password(password);

        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("connection error: {e}");
            }
        });
        client
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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

/// Far-future date range unique to this run so reruns against the same server
/// don't collide with earlier bookings.
fn run_base_date() -> NaiveDate {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    NaiveDate::from_ymd_opt(2100, 1, 1).unwrap() + Days::new(secs % 200_000 * 10)
}

fn slot_start(i: u32) -> String {
    format!("{:02}:00", 8 + i % SLOTS_PER_DAY)
}

fn slot_date(base: NaiveDate, i: u32) -> NaiveDate {
    base + Days::new((i / SLOTS_PER_DAY) as u64)
}

async fn setup(target: &Target) -> Ulid {
    let client = target.connect("admin").await;
    let service = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, name, duration, price, category) VALUES ('{service}', 'Bench facial', 60, 80, 'facial')"
        ))
        .await
        .unwrap();
    for dow in 0..7 {
        // A previous run may already have opened this weekday; the first row wins.
        let _ = client
            .batch_execute(&format!(
                "INSERT INTO weekly_availability (id, day_of_week, start_time, end_time) VALUES ('{}', {dow}, '08:00', '20:00')",
                Ulid::new()
            ))
            .await;
    }
    println!("  created service {service}");
    service
}

async fn phase1_sequential(target: &Target, service: Ulid, base: NaiveDate) {
    let client = target.connect("booking").await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO appointments (id, service_id, date, start_time, email, name, phone) VALUES ('{}', '{service}', '{}', '{}', 'seq{i}@bench.test', 'Bench guest', '+1 555 0100')",
                Ulid::new(),
                slot_date(base, i),
                slot_start(i),
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots; exactly one may win each.
async fn phase2_contention(target: &Target, service: Ulid, base: NaiveDate) {
    let n_tasks = 10;
    let n_slots = 240u32;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let target = target.clone();
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = target.connect("booking").await;
            for i in 0..n_slots {
                let result = client
                    .batch_execute(&format!(
                        "INSERT INTO appointments (id, service_id, date, start_time, email, name, phone) VALUES ('{}', '{service}', '{}', '{}', 'race{task}@bench.test', 'Bench guest', '+1 555 0100')",
                        Ulid::new(),
                        slot_date(base, i),
                        slot_start(i),
                    ))
                    .await;
                match result {
                    Ok(()) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(_) => conflicts.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots: {wins} booked, {conflicts} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(wins, n_slots as usize, "each slot must be booked exactly once");
}

async fn phase3_read_under_load(target: &Target, service: Ulid, base: NaiveDate) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u32 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = target.connect("booking").await;
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let n = w * 100_000 + i;
                let _ = client
                    .batch_execute(&format!(
                        "INSERT INTO appointments (id, service_id, date, start_time, email, name, phone) VALUES ('{}', '{service}', '{}', '{}', 'load{w}@bench.test', 'Bench guest', '+1 555 0100')",
                        Ulid::new(),
                        slot_date(base, n),
                        slot_start(n),
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = target.connect("booking").await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = base + Days::new((r * reads_per_reader + i) as u64 % 365);
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        "SELECT * FROM slots WHERE date = '{date}' AND service_id = '{service}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("slots query", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = target.connect("booking").await;
            for _ in 0..ops_per_conn {
                client
                    .batch_execute("SELECT * FROM services WHERE active = true")
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("SPABOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("SPABOOK_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid SPABOOK_PORT"),
        admin_password: std::env::var("SPABOOK_ADMIN_PASSWORD").unwrap_or_else(|_| "spabook".into()),
        booking_password: std::env::var("SPABOOK_BOOKING_PASSWORD").unwrap_or_else(|_| "booking".into()),
    };

    println!("=== spabook stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[setup]");
    let service = setup(&target).await;
    let base = run_base_date();

    // Each phase books its own block of days.
    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&target, service, base).await;

    println!("\n[phase 2] contended booking of identical slots");
    phase2_contention(&target, service, base + Days::new(400)).await;

    println!("\n[phase 3] slot reads under booking load");
    phase3_read_under_load(&target, service, base + Days::new(1000)).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== done ===");
}
