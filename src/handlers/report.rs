use std::sync::Arc;

use axum::{extract::State, response::IntoResponse};

use crate::state::AppState;

// Metrics report endpoint, plain text
pub async fn report_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.report()
}
