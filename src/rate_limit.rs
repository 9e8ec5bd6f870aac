use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::state::AppState;

// Body sent back when a request is denied
pub const DENIAL_BODY: &str = "You've been rate limited";

// Key used when the transport did not attach a peer address
const UNKNOWN_CLIENT: &str = "unknown";

// Per-client request count for the current frame.
struct WindowCounter {
    count: Mutex<u32>,
}

impl WindowCounter {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
        }
    }

    // Admission decision for one request. Bypassed requests are always
    // admitted, and every admitted request bumps the frame count.
    fn try_admit(&self, max: u32, bypass: bool) -> bool {
        let mut count = self.count.lock().expect("window counter poisoned");
        if !bypass && *count >= max {
            return false;
        }
        *count += 1;
        debug!(count = *count, "incremented");
        true
    }

    fn reset(&self) {
        let mut count = self.count.lock().expect("window counter poisoned");
        *count = 0;
    }

    #[cfg(test)]
    fn current(&self) -> u32 {
        *self.count.lock().expect("window counter poisoned")
    }
}

/// Admission control state: one window counter per client key, plus the
/// set of paths exempt from limiting.
pub struct AdmissionControl {
    clients: DashMap<String, Arc<WindowCounter>>,
    max_per_frame: u32,
    frame_duration: Duration,
    bypass_routes: Vec<String>,
}

impl AdmissionControl {
    pub fn new(max_per_frame: u32, frame_duration: Duration, bypass_routes: Vec<String>) -> Self {
        Self {
            clients: DashMap::new(),
            max_per_frame,
            frame_duration,
            bypass_routes,
        }
    }

    /// Full admission decision for one request: admit and count, or deny.
    pub fn admit(&self, key: &str, path: &str) -> bool {
        let counter = self.counter_for(key);
        counter.try_admit(self.max_per_frame, self.is_bypassed(path))
    }

    // Atomic get-or-create, so concurrent first requests for one key all
    // land on the same counter.
    fn counter_for(&self, key: &str) -> Arc<WindowCounter> {
        self.clients
            .entry(key.to_string())
            .or_insert_with(|| {
                info!(client = key, "new client window");
                Arc::new(WindowCounter::new())
            })
            .value()
            .clone()
    }

    fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_routes.iter().any(|route| route == path)
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    // Zeroes every counter. Called from the sweep task on each frame tick.
    fn sweep(&self) {
        for entry in self.clients.iter() {
            entry.value().reset();
        }
        debug!(clients = self.clients.len(), "frame reset");
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    fn frame_count(&self, key: &str) -> u32 {
        self.clients.get(key).map(|c| c.current()).unwrap_or(0)
    }
}

// Client key is the peer address as-is, IP plus port. Two sockets from one
// host count as separate clients, which keeps local testing simple.
fn client_key(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Middleware layer deciding admit-or-deny before the inner handler runs.
pub async fn admission_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let key = client_key(&req);

    if !state.admission.admit(&key, req.uri().path()) {
        debug!(client = %key, path = %req.uri().path(), "denied");
        return (StatusCode::TOO_MANY_REQUESTS, DENIAL_BODY).into_response();
    }

    next.run(req).await
}

// Shared frame sweep: a single task resets every client counter on each
// tick, instead of one timer per client.
pub async fn frame_sweeper(admission: Arc<AdmissionControl>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(admission.frame_duration());
    // interval fires immediately, skip the first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => admission.sweep(),
            _ = shutdown.changed() => {
                debug!("frame sweeper stopped");
                return;
            }
        }
    }
}
