//! Server initialization for the HTTP (REST + WebSocket) and MCP stdio surfaces.
//!
//! Provides [`serve`] and [`serve_stdio`] entry points that wire up the database,
//! memory engine, identity service and gateway.

use crate::binding::DeviceId;
use crate::config::GatewayConfig;
use crate::db;
use crate::engine;
use crate::gateway::Gateway;
use crate::identity::{Credential, IdentityService};
use crate::scope::ScopeRequest;
use crate::tools::GatewayTools;
use anyhow::{Context, Result};
use rmcp::ServiceExt;
use std::sync::Arc;

/// Shared setup: open the database, create the engine, assemble the gateway.
pub fn build_gateway(config: GatewayConfig) -> Result<Gateway> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");
    let db = db::shared(conn);

    let engine = engine::create_engine(&config.engine)?;
    tracing::info!(provider = %config.engine.provider, "memory engine ready");

    let identity = IdentityService::new(db.clone(), config.auth.clone());
    Ok(Gateway::new(db, engine, identity, Arc::new(config)))
}

/// Serve REST and the WebSocket gateway until ctrl-c.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let gateway = build_gateway(config)?;
    let router = crate::api::router(gateway);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "memgate listening (REST + ws://{bind_addr}/gateway/ws)");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}

/// Authenticate once, then expose the gateway tools over MCP stdio.
pub async fn serve_stdio(
    config: GatewayConfig,
    api_key: String,
    app_name: Option<String>,
    device: Option<String>,
) -> Result<()> {
    let gateway = build_gateway(config)?;
    let scope = ScopeRequest {
        app_id: None,
        device: device.as_deref().map(DeviceId::parse).transpose()?,
        app_name,
    };
    let session = gateway
        .open_session(Credential::ApiKey(api_key), scope, "mcp")
        .await
        .context("stdio authentication failed")?;

    tracing::info!("starting memgate MCP server on stdio");
    let tools = GatewayTools::new(gateway, session);
    let server = tools.serve(rmcp::transport::stdio()).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    Ok(())
}
