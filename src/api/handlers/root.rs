use axum::response::IntoResponse;

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service banner", body = String)),
    tag = "health"
)]
pub async fn root() -> impl IntoResponse {
    format!(
        "{} {} ({})\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        crate::GIT_COMMIT_HASH
    )
}
