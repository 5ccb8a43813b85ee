use gaze_bridge::{BridgeConfig, BridgeState, BroadcastHub, EventRecorder, SessionRunner};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gaze_bridge=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting gaze bridge");

    let config = BridgeConfig::from_env()?;

    let hub = Arc::new(BroadcastHub::new());
    let recorder = Arc::new(EventRecorder::new(config.recording_capacity));
    let runner = Arc::new(SessionRunner::new(
        config.clone(),
        Arc::clone(&hub),
        Arc::clone(&recorder),
    ));

    let state = BridgeState {
        runner,
        recorder,
        config: config.clone(),
    };

    let app = gaze_bridge::router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_addr.parse()?;
    info!("🎧 Control surface on http://{}", addr);
    info!(
        "📡 Broadcast endpoint (while streaming): ws://{}",
        config.ws_bind_addr
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
