use axum::response::IntoResponse;

/// Undocumented banner route; lets load balancers and humans identify the
/// service without hitting the database.
pub async fn root() -> impl IntoResponse {
    concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
}
