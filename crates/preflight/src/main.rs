use anyhow::{Context, Result};
use clap::Parser;
use harness_core::{
    effective_page_size, fetch_listing, CacheKind, Config, CredentialPool, HttpClient, Request,
    ReqwestClient, Session,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Preflight checks for a load run (target health, listing endpoints, credentials)")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Poll the health endpoint this many times before checking (0 = check once)
    #[arg(long, default_value_t = 0)]
    wait_retries: u32,

    /// Delay between health polls in milliseconds
    #[arg(long, default_value_t = 2000)]
    wait_delay_ms: u64,
}

const HEALTH_PATH: &str = "/api/health";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    info!("Validating target base URL...");
    let base = validate_base_url(&cfg.target.base_url)
        .with_context(|| format!("Invalid target.base_url: {}", cfg.target.base_url))?;
    let shown_base = base.as_str().trim_end_matches('/').to_string();

    let client = ReqwestClient::new(&shown_base, cfg.target.timeout_ms.max(1))
        .context("Failed to build HTTP client")?;
    let session = Session::new();

    println!();
    println!("=== Preflight ({shown_base}) ===");

    if args.wait_retries > 0
        && !wait_for_health(&client, &session, args.wait_retries, args.wait_delay_ms).await
    {
        anyhow::bail!("Target did not become healthy after {} polls", args.wait_retries);
    }

    let mut failures = 0u64;
    if !check_required(&client, &session, HEALTH_PATH).await {
        failures = failures.saturating_add(1);
    }

    println!();
    for kind in CacheKind::ALL {
        check_listing_best_effort(&client, &session, kind, cfg.reference.page_size).await;
    }

    println!();
    let credentials_path = cfg.credentials_path();
    let pool = CredentialPool::load(&credentials_path, &cfg.credentials.env_var);
    println!(
        "Credentials: {} bundle(s) from {} / ${}",
        pool.len(),
        credentials_path.display(),
        cfg.credentials.env_var
    );
    if pool.is_empty() && cfg.users.iter().any(|m| m.weight > 0 && m.class.is_authenticated()) {
        warn!("Authenticated user classes are configured but no credentials were found");
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} required endpoint check(s) failed");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

fn validate_base_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("Base URL must be http:// or https:// (got {raw})");
    }
    if !url.username().is_empty() || url.password().is_some() {
        anyhow::bail!("Base URL must not include credentials (got {raw})");
    }
    if url.host_str().is_none() {
        anyhow::bail!("Base URL must include a hostname (got {raw})");
    }

    // Request paths are appended to the base, so it must be bare.
    if url.path() != "/" {
        anyhow::bail!(
            "Base URL must not include a path (got path={}, url={raw})",
            url.path()
        );
    }
    if url.query().is_some() || url.fragment().is_some() {
        anyhow::bail!("Base URL must not include query/fragment (got {raw})");
    }

    Ok(url)
}

async fn wait_for_health(client: &ReqwestClient, session: &Session, retries: u32, delay_ms: u64) -> bool {
    info!("Waiting for {} (up to {} polls)...", HEALTH_PATH, retries);
    let request = Request::get(HEALTH_PATH, HEALTH_PATH);
    for attempt in 1..=retries {
        match client.send(session, &request).await {
            Ok(r) if r.is_success() => {
                info!("Target is ready after {} poll(s)", attempt);
                return true;
            }
            Ok(r) => info!("Health poll {} returned {}", attempt, r.status),
            Err(e) => info!("Health poll {} failed: {:#}", attempt, e),
        }
        if attempt < retries {
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
    false
}

async fn check_required(client: &ReqwestClient, session: &Session, path: &str) -> bool {
    match client.send(session, &Request::get(path, path)).await {
        Ok(r) => {
            println!("GET {:<44} -> {} ({}ms)", path, r.status, r.latency_ms);
            if !r.is_success() {
                warn!("Required endpoint returned non-2xx: {} {}", path, r.status);
                return false;
            }
            true
        }
        Err(e) => {
            println!("GET {:<44} -> ERROR", path);
            warn!("Required endpoint request failed: {} error={:#}", path, e);
            false
        }
    }
}

/// Fetch one listing the way the reference cache would and report the result.
/// Failures only warn: the worker falls back to placeholders.
async fn check_listing_best_effort(
    client: &ReqwestClient,
    session: &Session,
    kind: CacheKind,
    page_size: u32,
) {
    let page_size = effective_page_size(page_size);
    let path = kind.listing_path(page_size);
    match fetch_listing(kind, page_size, client, session).await {
        Ok(ids) => {
            let sample: Vec<String> = ids.iter().take(3).map(ToString::to_string).collect();
            println!(
                "GET {:<44} -> {} {} (e.g. {})",
                path,
                ids.len(),
                kind,
                sample.join(", ")
            );
        }
        Err(e) => {
            println!("GET {:<44} -> no {}", path, kind);
            warn!("{} unavailable, workers will use placeholders: {}", kind, e);
        }
    }
}
