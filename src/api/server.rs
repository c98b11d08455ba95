use std::net::SocketAddr;

use tower_http::cors::{Any, CorsLayer};

use super::routes::{create_router, ApiState};

/// Serve the execution API on the given port until the process exits.
pub async fn start_api_server(
    state: ApiState,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state).layer(cors);

    log::info!("starting STRATA API server on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
