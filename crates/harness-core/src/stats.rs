use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::client::{HttpClient, Method, Request, ResponseFuture, Session};

/// Width of one latency bucket in milliseconds.
const BUCKET_MS: u64 = 10;
/// 1000 buckets of 10ms: everything from 10s up lands in the last one.
const BUCKET_COUNT: usize = 1000;

/// One finished request as seen by the recording client.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub method: Method,
    pub name: String,
    /// `None` when no response arrived.
    pub status: Option<u16>,
    pub latency_ms: u64,
}

impl RequestSample {
    pub fn is_failure(&self) -> bool {
        match self.status {
            Some(status) => status >= 400,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    buckets: Vec<u64>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: vec![0; BUCKET_COUNT],
        }
    }

    fn record(&mut self, latency_ms: u64) {
        let idx = ((latency_ms / BUCKET_MS) as usize).min(BUCKET_COUNT - 1);
        self.buckets[idx] += 1;
    }

    fn merge(&mut self, other: &Histogram) {
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            *mine += theirs;
        }
    }

    /// Upper edge in ms of the bucket holding the p-th percentile.
    fn percentile(&self, p: u64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0;
        }

        let target = ((total * p) / 100).max(1);
        let mut cumulative = 0u64;

        for (bucket_idx, &count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return (bucket_idx as u64 + 1) * BUCKET_MS;
            }
        }

        BUCKET_COUNT as u64 * BUCKET_MS
    }
}

#[derive(Debug, Clone)]
struct EndpointStats {
    requests: u64,
    failures: u64,
    transport_errors: u64,
    latency: Histogram,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            requests: 0,
            failures: 0,
            transport_errors: 0,
            latency: Histogram::new(),
        }
    }
}

/// Per-label request statistics for one worker run.
#[derive(Debug, Clone)]
pub struct StatsCollector {
    endpoints: BTreeMap<(Method, String), EndpointStats>,
    start_time: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, sample: &RequestSample) {
        let entry = self
            .endpoints
            .entry((sample.method, sample.name.clone()))
            .or_insert_with(EndpointStats::new);
        entry.requests += 1;
        if sample.is_failure() {
            entry.failures += 1;
        }
        match sample.status {
            Some(_) => entry.latency.record(sample.latency_ms),
            None => entry.transport_errors += 1,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn summary(&self) -> StatsSummary {
        let duration_ms = self.elapsed_ms();
        let mut total = EndpointStats::new();
        let mut endpoints = Vec::with_capacity(self.endpoints.len());

        for ((method, name), stats) in &self.endpoints {
            total.requests += stats.requests;
            total.failures += stats.failures;
            total.transport_errors += stats.transport_errors;
            total.latency.merge(&stats.latency);
            endpoints.push(EndpointSummary {
                method: *method,
                name: name.clone(),
                requests: stats.requests,
                failures: stats.failures,
                latency_p50_ms: stats.latency.percentile(50),
                latency_p95_ms: stats.latency.percentile(95),
            });
        }

        StatsSummary {
            requests: total.requests,
            failures: total.failures,
            transport_errors: total.transport_errors,
            error_rate: ratio(total.failures, total.requests),
            requests_per_sec: ratio(total.requests * 1000, duration_ms),
            latency_p50_ms: total.latency.percentile(50),
            latency_p95_ms: total.latency.percentile(95),
            latency_p99_ms: total.latency.percentile(99),
            duration_ms,
            endpoints,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSummary {
    pub method: Method,
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub requests: u64,
    pub failures: u64,
    pub transport_errors: u64,
    pub error_rate: f64,
    pub requests_per_sec: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub duration_ms: u64,
    pub endpoints: Vec<EndpointSummary>,
}

/// Client wrapper that reports every request to the stats channel.
pub struct RecordingClient {
    inner: Arc<dyn HttpClient>,
    samples: mpsc::Sender<RequestSample>,
}

impl RecordingClient {
    pub fn new(inner: Arc<dyn HttpClient>, samples: mpsc::Sender<RequestSample>) -> Self {
        Self { inner, samples }
    }
}

impl HttpClient for RecordingClient {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn send<'a>(&'a self, session: &'a Session, request: &'a Request) -> ResponseFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.inner.send(session, request).await;
            let (status, latency_ms) = match &result {
                Ok(response) => (Some(response.status), response.latency_ms),
                Err(_) => (None, start.elapsed().as_millis() as u64),
            };
            // The collector may already be gone during shutdown.
            let _ = self
                .samples
                .send(RequestSample {
                    method: request.method,
                    name: request.name.clone(),
                    status,
                    latency_ms,
                })
                .await;
            result
        })
    }
}
