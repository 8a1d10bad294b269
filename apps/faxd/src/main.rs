//! faxd: fax gateway daemon.
//!
//! ```text
//! POST /fax accepts a document; the dispatcher sends it through the active
//! provider backend; vendors call back with delivery status; inbound faxes
//! arrive on per-vendor webhook routes and are served behind capability
//! tokens.
//! ```

use anyhow::Result;

use faxd::{AppState, FaxConfig, build_router, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    let config = FaxConfig::from_env()?;
    let bind = config.bind.clone();
    let state = AppState::new(config)?;

    if state.registry.active_outbound() == "telephony" && !state.config.disabled {
        let ami = state.ami.clone();
        tokio::spawn(async move {
            ami.connect().await;
        });
    }

    let app = build_router(state);
    let addr: std::net::SocketAddr = bind.parse()?;
    tracing::info!("faxd listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
