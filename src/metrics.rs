use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::response::Parts,
    middleware::Next,
    response::Response,
};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::state::AppState;

const NO_DATA_REPORT: &str = "No requests recorded yet\n";

/// One request observation. `end` and `duration` are stamped exactly once,
/// when the response is released; until then the record reads as zero.
#[derive(Clone, Copy)]
struct RequestRecord {
    start: Instant,
    end: Option<Instant>,
    duration: Option<Duration>,
}

/// Owns every completed request record plus the rolling requests-per-second
/// counter. Records are append-only in arrival order, so an index handed
/// out by `begin` stays valid for the process lifetime.
pub struct MetricsRegistry {
    records: Mutex<Vec<RequestRecord>>,
    requests_per_second: AtomicU32,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            requests_per_second: AtomicU32::new(0),
        }
    }

    // Opens a record for an arriving request and returns its handle.
    pub fn begin(&self) -> usize {
        let mut records = self.records.lock().expect("metrics records poisoned");
        records.push(RequestRecord {
            start: Instant::now(),
            end: None,
            duration: None,
        });
        self.requests_per_second.fetch_add(1, Ordering::Relaxed);
        records.len() - 1
    }

    // Stamps the end timestamp and computes the duration. A record is only
    // ever finalized once; later calls are no-ops.
    fn finalize(&self, idx: usize) {
        let mut records = self.records.lock().expect("metrics records poisoned");
        let record = &mut records[idx];
        if record.end.is_none() {
            let end = Instant::now();
            record.end = Some(end);
            record.duration = Some(end - record.start);
        }
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second.load(Ordering::Relaxed)
    }

    fn reset_requests_per_second(&self) {
        self.requests_per_second.store(0, Ordering::Relaxed);
    }

    /// Plain-text report: average duration, 99th percentile, current
    /// requests per second and the per-request listing in arrival order.
    pub fn report(&self) -> String {
        let durations: Vec<Duration> = {
            let records = self.records.lock().expect("metrics records poisoned");
            records
                .iter()
                .map(|r| r.duration.unwrap_or(Duration::ZERO))
                .collect()
        };

        if durations.is_empty() {
            return NO_DATA_REPORT.to_string();
        }

        let total: Duration = durations.iter().sum();
        let average = total / durations.len() as u32;

        let mut sorted = durations.clone();
        sorted.sort();
        let p99 = sorted[durations.len() / 100];

        let mut out = String::new();
        out.push_str(&format!("Average request duration: {:?}\n", average));
        out.push_str(&format!("99p: {:?}\n", p99));
        out.push_str(&format!("{} Requests per second\n", self.requests_per_second()));
        out.push_str(&format!("{} Requests:\n\n", durations.len()));
        for (i, duration) in durations.iter().enumerate() {
            out.push_str(&format!("{}: {:?}\n", i + 1, duration));
        }
        out
    }

    #[cfg(test)]
    fn push_finished(&self, duration: Duration) {
        let mut records = self.records.lock().expect("metrics records poisoned");
        let start = Instant::now();
        records.push(RequestRecord {
            start,
            end: Some(start + duration),
            duration: Some(duration),
        });
    }

    #[cfg(test)]
    fn duration_of(&self, idx: usize) -> Option<Duration> {
        self.records.lock().expect("metrics records poisoned")[idx].duration
    }
}

/// Buffered copy of the inner handler's response. Status, headers and body
/// are held back together until the request record is stamped, then
/// released in one piece, so body bytes never precede the status line.
pub struct BufferedResponse {
    parts: Parts,
    body: Bytes,
}

impl BufferedResponse {
    // Drains the inner response. A body that fails to collect is logged
    // and replaced with an empty one; the request still completes.
    pub async fn capture(response: Response) -> Self {
        let (parts, body) = response.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("could not buffer response body: {err}");
                Bytes::new()
            }
        };
        Self { parts, body }
    }

    // Stamps the record, then emits status, headers and body together.
    // Consuming `self` makes the release single-shot.
    pub fn release(self, metrics: &MetricsRegistry, idx: usize) -> Response {
        metrics.finalize(idx);
        Response::from_parts(self.parts, Body::from(self.body))
    }
}

/// Outermost middleware layer: opens a record on entry, buffers the inner
/// response and stamps the duration before anything reaches the client.
pub async fn metrics_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let idx = state.metrics.begin();
    let response = next.run(req).await;
    BufferedResponse::capture(response)
        .await
        .release(&state.metrics, idx)
}

// Zeroes the requests-per-second counter every second, independent of
// traffic and of concurrent report() calls.
pub async fn requests_per_second_reset(
    metrics: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => metrics.reset_requests_per_second(),
            _ = shutdown.changed() => {
                debug!("requests-per-second reset stopped");
                return;
            }
        }
    }
}
