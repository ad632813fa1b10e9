use async_trait::async_trait;
use bincode::{Decode, Encode};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use vigil::core::Utc;
use vigil::prelude::{
    CancellationToken, Duration, EnqueueOptions, JobError, JobProcessor, Queue, WatchDog,
    WatchDogOptions, Worker, WorkerOptions, Xid,
};
use vigil_sqlite::{SqliteStore, MIGRATOR};

struct JobResult {
    pub duration_millis: i64,
    pub jid: Xid,
}

#[derive(Decode, Encode)]
struct BenchJobPayload {
    pub started_at_millis: i64,
}

impl Default for BenchJobPayload {
    fn default() -> Self {
        Self {
            started_at_millis: Utc::now().timestamp_millis(),
        }
    }
}

struct BenchJob {
    tx: UnboundedSender<JobResult>,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl JobProcessor for BenchJob {
    type Payload = BenchJobPayload;
    type Output = ();
    type Error = JobError;

    async fn handle(
        &self,
        jid: Xid,
        payload: Self::Payload,
        _cancellation_token: CancellationToken,
    ) -> Result<(), Self::Error> {
        let _count = self.count.fetch_add(1, Ordering::SeqCst);
        let duration_millis = Utc::now().timestamp_millis() - payload.started_at_millis;
        self.tx
            .unbounded_send(JobResult {
                duration_millis,
                jid,
            })
            .map_err(|_| anyhow::anyhow!("Failed to send results"))?;
        Ok(())
    }

    fn name() -> &'static str
    where
        Self: Sized,
    {
        "bench_job"
    }
}

async fn make_pool() -> SqlitePool {
    // One connection, every ":memory:" connection is a separate database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    MIGRATOR.run(&pool).await.unwrap();
    pool
}

async fn schedule_tasks(count: usize, queue: Queue<SqliteStore>) {
    for _ in 0..count {
        if let Err(e) = queue
            .enqueue::<BenchJob>(BenchJobPayload::default(), EnqueueOptions::default())
            .await
        {
            eprintln!("Failed to schedule job: {}", e);
        }
    }
}

fn arg<T: FromStr>(position: usize, default: T) -> T {
    std::env::args()
        .nth(position)
        .and_then(|c| T::from_str(&c).ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
        .init();

    let count: usize = arg(1, 10_000);
    let concurrency: usize = arg(2, 10);
    let workers: usize = arg(3, 4);

    let (tx, rx) = unbounded::<JobResult>();
    let pool = make_pool().await;
    let store = Arc::new(SqliteStore::with_pool(pool));
    let queue = Queue::with_store("bench", store.clone());

    let processed = Arc::new(AtomicUsize::new(0));
    let options = WorkerOptions::default()
        .with_interval(Duration::milliseconds(1))
        .with_concurrency(concurrency);
    let mut running = Vec::with_capacity(workers);
    for _ in 0..workers {
        let mut worker = Worker::new(vec![Queue::with_store("bench", store.clone())], options.clone());
        let job_handler = BenchJob {
            tx: tx.clone(),
            count: processed.clone(),
        };
        if let Err(e) = worker.register(job_handler).and_then(|w| w.start()) {
            eprintln!("Failed to start worker: {}", e);
            return;
        }
        running.push(worker);
    }
    drop(tx);

    let mut watchdog = WatchDog::new(
        queue.clone(),
        WatchDogOptions::default().with_interval(Duration::seconds(1)),
    );
    if let Err(e) = watchdog.start() {
        eprintln!("Failed to start watchdog: {}", e);
        return;
    }

    let started = Instant::now();
    let _task_maker = tokio::spawn(schedule_tasks(count, queue.clone()));

    let mut results = rx.take(count).collect::<Vec<JobResult>>().await;

    let seen_ids = { results.iter().map(|r| r.jid).collect::<HashSet<Xid>>() };

    if seen_ids.len() < results.len() {
        eprintln!("Got some duplicates yo");
    }

    let total_duration = started.elapsed();
    watchdog.stop();
    for mut worker in running {
        worker.stop().await;
    }

    if results.is_empty() {
        eprintln!("Nothing was processed");
        return;
    }
    let last = results.len() - 1;
    results.sort_by_key(|r| r.duration_millis);
    let throughput = results.len() as f64 / total_duration.as_secs_f64();
    let (min, max, median, pct) = (
        results[0].duration_millis,
        results[last].duration_millis,
        results[last / 2].duration_millis,
        results[(last * 19) / 20].duration_millis,
    );

    println!("Processed: {} jobs", processed.load(Ordering::SeqCst));
    println!("min: {}ms", min);
    println!("max: {}ms", max);
    println!("median: {}ms", median);
    println!("95th percentile: {}ms", pct);
    println!("throughput: {}/s", throughput);
}
