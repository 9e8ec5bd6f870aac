use std::sync::Arc;

use crate::metrics::MetricsRegistry;
use crate::rate_limit::AdmissionControl;

// App's shared state. Both layers also run a background timer which gets a
// clone of its Arc at startup.
pub struct AppState {
    pub admission: Arc<AdmissionControl>,
    pub metrics: Arc<MetricsRegistry>,
}
