// HTTP API Server module

use anyhow::Result;
use axum::{
    http::Method,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::proxy::ProxyManager;

pub mod error;
pub mod gemini;
mod handlers;
pub mod openai;

pub use handlers::CONVERSATION_HEADER;

#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<ProxyManager>,
}

fn openai_routes() -> Router<AppState> {
    Router::new()
        .route("/models", get(handlers::list_models))
        .route("/models/:id", get(handlers::get_model))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/embeddings", post(handlers::embeddings))
        .route("/conversations/:id", delete(handlers::delete_conversation))
}

/// Full application router. The OpenAI surface is served under both
/// `/v1` and `/openai/v1`.
pub fn build_router(proxy: Arc<ProxyManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .nest("/v1", openai_routes())
        .nest("/openai/v1", openai_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { proxy })
}

pub async fn start_server(addr: &str, proxy: Arc<ProxyManager>) -> Result<()> {
    let app = build_router(proxy);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
