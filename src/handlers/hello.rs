use axum::response::IntoResponse;

// Terminal greeting handler
pub async fn hello_handler() -> impl IntoResponse {
    "hello!\n"
}
