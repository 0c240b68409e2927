//! Emergency Service Hub
//!
//! Backend for a home-emergency call centre: alerts from elderly clients'
//! devices arrive here, and dispatchers escalate them to family, physician,
//! ambulance and conference calls through a telephony provider.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod alerts;
mod chain;
mod config;
mod dashboard;
mod error;
mod escalation;
mod gateway;
mod handlers;
mod models;
mod reporting;
mod seed;
mod simulator;
mod softphone;
mod state;
mod store;
mod validation;

use crate::config::Settings;
use crate::gateway::{HttpGateway, TelephonyGateway};
use crate::simulator::DeviceSimulator;
use crate::state::AppState;
use crate::store::{MemoryStore, Repository};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenv::dotenv().ok();

    // Logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,emergency_hub=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();

    // Load configuration
    let settings = Settings::from_env().context("Failed to load configuration")?;
    let bind_address = format!("{}:{}", settings.server.host, settings.server.port);

    info!("Starting emergency service hub");
    info!("Binding server to {}", bind_address);

    let repo: Arc<dyn Repository> = Arc::new(MemoryStore::new());
    let gateway: Arc<dyn TelephonyGateway> = Arc::new(
        HttpGateway::new(settings.gateway.clone()).context("Failed to build gateway client")?,
    );

    if settings.seed_demo_data {
        seed::load_demo_data(repo.as_ref())
            .await
            .context("Failed to load demo data")?;
    }

    // ---------------------------------------------------------------------
    // Device simulator background task
    // IMPORTANT: use actix_rt::spawn (NOT tokio::spawn)
    // ---------------------------------------------------------------------
    if settings.simulator.enabled {
        let simulator = DeviceSimulator::new(settings.simulator.interval_ms)
            .context("Failed to initialize device simulator")?;
        let simulator_repo = repo.clone();
        actix_rt::spawn(async move {
            simulator.run(simulator_repo).await;
        });
    }

    let app_state = AppState::new(settings, repo, gateway);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
