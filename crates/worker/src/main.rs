use anyhow::{Context, Result};
use clap::Parser;
use harness_core::{
    CacheKind, CacheState, Config, CredentialPool, HttpClient, MockClient, RampPlanner,
    RecordingClient, ReferenceCache, ReqwestClient, RequestSample, StatsCollector, StatsSummary,
    UserContext, UserMix,
};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Crowdfund load worker - runs simulated user populations against the target")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Transport mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Only run user classes carrying one of these tags (comma separated)
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Print stats every N milliseconds
    #[arg(long, default_value = "5000")]
    print_every_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    timestamp: String,
    seed: u64,
    mode: String,
    users_started: u64,
    users_by_class: BTreeMap<String, u64>,
    credential_bundles: usize,
    reference_data: BTreeMap<String, String>,
    #[serde(flatten)]
    stats: StatsSummary,
}

struct RunningUser {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Override worker ID if provided
    if let Some(worker_id) = args.worker_id {
        config.worker.id = worker_id;
    }

    // Apply the tag filter to the configured user mix
    let mix = select_user_mix(&config.users, &args.tags)?;

    info!("Starting worker '{}' in {} mode", config.worker.id, args.mode);
    info!("Seed: {}", config.scenario.seed);
    info!("Target: {}", config.target.base_url);
    for entry in &mix {
        info!("User class {} weight {}", entry.class, entry.weight);
    }

    // Create client based on mode
    let client: Arc<dyn HttpClient> = match args.mode.as_str() {
        "mock" => Arc::new(MockClient::with_canned_listings(5)),
        "http" => Arc::new(
            ReqwestClient::new(&config.target.base_url, config.target.timeout_ms)
                .context("Failed to create HTTP client")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    info!("Using client: {}", client.name());

    // Load credential bundles once for all users
    let credentials_path = config.credentials_path();
    let pool = Arc::new(CredentialPool::load(
        &credentials_path,
        &config.credentials.env_var,
    ));
    if pool.is_empty() && mix.iter().any(|m| m.class.is_authenticated()) {
        warn!(
            "No credentials in {} or {}; authenticated users will run anonymously",
            credentials_path.display(),
            config.credentials.env_var
        );
    }

    // Run the load test
    let result = run_load_test(&config, &args.mode, client, pool, mix, args.print_every_ms).await?;

    // Write results to file
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = format!("results/worker_{}_{}.json", config.worker.id, timestamp);

    std::fs::create_dir_all("results").ok();
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)?;

    info!("Results written to {}", output_path);
    print_summary(&result);

    Ok(())
}

fn select_user_mix(users: &[UserMix], tags: &[String]) -> Result<Vec<UserMix>> {
    let mix: Vec<UserMix> = users
        .iter()
        .filter(|m| m.weight > 0)
        .filter(|m| tags.is_empty() || m.class.has_any_tag(tags))
        .cloned()
        .collect();
    if mix.is_empty() {
        anyhow::bail!("No user classes left to run (tags filter: {:?})", tags);
    }
    Ok(mix)
}

async fn run_load_test(
    config: &Config,
    mode: &str,
    client: Arc<dyn HttpClient>,
    pool: Arc<CredentialPool>,
    mix: Vec<UserMix>,
    print_every_ms: u64,
) -> Result<WorkerResult> {
    // Create ramp planner
    let start_time = Instant::now();
    let planner =
        RampPlanner::new(config.ramp.clone()).with_duration_cap(config.scenario.duration_ms);

    info!(
        "Planned {} ramp steps, total duration: {}ms",
        planner.steps().len(),
        planner.total_duration_ms()
    );

    // Reference data shared by every user in this worker
    let cache = Arc::new(ReferenceCache::new(&config.reference));

    // Create channel for collecting request samples
    let (sample_tx, mut sample_rx) = mpsc::channel::<RequestSample>(10000);
    let client: Arc<dyn HttpClient> = Arc::new(RecordingClient::new(client, sample_tx));

    // Spawn stats collector task
    let stats_handle = tokio::spawn(async move {
        let mut stats = StatsCollector::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(print_every_ms.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                sample = sample_rx.recv() => match sample {
                    Some(sample) => stats.record(&sample),
                    None => break,
                },
                _ = ticker.tick() => print_progress(&stats),
            }
        }
        stats
    });

    let class_picker = WeightedIndex::new(mix.iter().map(|m| m.weight))
        .context("Invalid user class weights")?;
    let mut rng = StdRng::seed_from_u64(config.scenario.seed);
    let hatch_interval = RampPlanner::hatch_interval(config.worker.hatch_rate)
        .max(Duration::from_millis(1));

    // Execute ramp plan
    let mut running: Vec<RunningUser> = Vec::new();
    let mut stopping: Vec<JoinHandle<()>> = Vec::new();
    let mut users_by_class: BTreeMap<String, u64> = BTreeMap::new();
    let mut next_id = 0usize;
    let mut last_target = None;

    while let Some(target) = planner.target_users(start_time.elapsed().as_millis() as u64) {
        let target = target as usize;
        if last_target != Some(target) {
            info!("Ramp target: {} users (running {})", target, running.len());
            last_target = Some(target);
        }

        if running.len() < target {
            let class = mix[class_picker.sample(&mut rng)].class;
            let user = UserContext::new(
                next_id,
                class,
                client.clone(),
                cache.clone(),
                config.scenario.seed,
            )?;
            running.push(spawn_user(user, pool.clone()));
            *users_by_class.entry(class.to_string()).or_default() += 1;
            next_id += 1;
            sleep(hatch_interval).await;
            continue;
        }

        // Step down: stop the most recently started users
        while running.len() > target {
            if let Some(user) = running.pop() {
                let _ = user.stop.send(true);
                stopping.push(user.handle);
            }
        }
        sleep(Duration::from_millis(100)).await;
    }

    info!("Ramp finished, stopping {} users", running.len());
    for user in running.drain(..) {
        let _ = user.stop.send(true);
        stopping.push(user.handle);
    }
    for handle in stopping {
        if let Err(e) = handle.await {
            warn!("User task ended abnormally: {}", e);
        }
    }

    // Last sender goes away with the client; the collector then drains and exits.
    drop(client);
    let stats = stats_handle.await?;

    // Report how each reference kind settled
    let mut reference_data = BTreeMap::new();
    for kind in CacheKind::ALL {
        reference_data.insert(kind.to_string(), describe_state(&cache.state(kind).await));
    }

    Ok(WorkerResult {
        worker_id: config.worker.id.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        seed: config.scenario.seed,
        mode: mode.to_string(),
        users_started: next_id as u64,
        users_by_class,
        credential_bundles: pool.len(),
        reference_data,
        stats: stats.summary(),
    })
}

fn spawn_user(mut user: UserContext, pool: Arc<CredentialPool>) -> RunningUser {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        user.on_start(&pool).await;
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let task = user.next_task();
            if let Err(e) = user.run_task(task).await {
                debug!("User {} ({}) task {} failed: {:#}", user.id(), user.class(), task.name, e);
            }
            let wait = user.wait_time();
            tokio::select! {
                _ = sleep(wait) => {}
                _ = stop_rx.changed() => break,
            }
        }
    });
    RunningUser {
        stop: stop_tx,
        handle,
    }
}

fn describe_state(state: &CacheState) -> String {
    match state {
        CacheState::NotFetched { attempts } => format!("not_fetched ({attempts} attempts)"),
        CacheState::Fetched(ids) => format!("fetched ({} ids)", ids.len()),
        CacheState::GivenUp => "given_up (placeholders)".to_string(),
    }
}

fn print_progress(stats: &StatsCollector) {
    let summary = stats.summary();
    info!(
        "Progress: requests={} failures={} rps={:.1} error_rate={:.3} p50={}ms p95={}ms p99={}ms",
        summary.requests,
        summary.failures,
        summary.requests_per_sec,
        summary.error_rate,
        summary.latency_p50_ms,
        summary.latency_p95_ms,
        summary.latency_p99_ms
    );
}

fn print_summary(result: &WorkerResult) {
    let stats = &result.stats;
    println!("\n=== Worker {} Summary ===", result.worker_id);
    println!("Duration: {}ms", stats.duration_ms);
    println!("Users started: {}", result.users_started);
    for (class, count) in &result.users_by_class {
        println!("  {class}: {count}");
    }
    println!("Credential bundles: {}", result.credential_bundles);
    for (kind, state) in &result.reference_data {
        println!("Reference {kind}: {state}");
    }
    println!("Requests: {}", stats.requests);
    println!("Failures: {}", stats.failures);
    println!("Transport errors: {}", stats.transport_errors);
    println!("Error rate: {:.2}%", stats.error_rate * 100.0);
    println!("Requests/s: {:.1}", stats.requests_per_sec);
    println!("Latency p50: {}ms", stats.latency_p50_ms);
    println!("Latency p95: {}ms", stats.latency_p95_ms);
    println!("Latency p99: {}ms", stats.latency_p99_ms);
    println!();
    println!("{:<6} {:<48} {:>8} {:>8} {:>8} {:>8}", "METHOD", "NAME", "REQS", "FAILS", "P50", "P95");
    for endpoint in &stats.endpoints {
        println!(
            "{:<6} {:<48} {:>8} {:>8} {:>8} {:>8}",
            endpoint.method.to_string(),
            endpoint.name,
            endpoint.requests,
            endpoint.failures,
            endpoint.latency_p50_ms,
            endpoint.latency_p95_ms
        );
    }
    println!();
}
