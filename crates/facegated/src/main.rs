use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use facegate_core::backend::{ModelPaths, OnnxBackends};
use facegate_core::{EnrollmentBuilder, VerificationOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod engine;
mod store;
#[cfg(test)]
mod testing;

use api::AppState;
use config::Config;
use engine::{spawn_engine, Pipeline};
use store::{Store, StoreReferences};

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        similarity_threshold = config.similarity_threshold,
        "configuration loaded"
    );

    if config.verify_models {
        facegate_models::verify_models_dir(&config.model_dir).context("model integrity check failed")?;
    }

    let backends = OnnxBackends::load(&ModelPaths::from_dir(&config.model_dir), config.liveness_threshold)
        .context("failed to load models")?;

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    let references = Arc::new(StoreReferences::new(store.clone(), tokio::runtime::Handle::current()));

    let pipeline = Pipeline {
        enrollment: EnrollmentBuilder::new(backends.embedder.clone()),
        verification: VerificationOrchestrator::new(
            backends.embedder,
            backends.liveness,
            backends.pose,
            references,
        )
        .with_similarity_threshold(config.similarity_threshold),
    };
    let engine = spawn_engine(
        pipeline,
        config.engine_workers,
        config.engine_queue,
        Duration::from_secs(config.inference_timeout_secs),
    )?;

    let state = web::Data::new(AppState {
        engine,
        store,
        capture_dir: config.capture_dir.clone(),
    });
    let max_form_bytes = config.max_form_bytes;

    tracing::info!(bind = %config.bind, "facegated ready");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(|cfg| api::configure(cfg, max_form_bytes))
    })
    .bind(&config.bind)
    .with_context(|| format!("failed to bind {}", config.bind))?
    .run()
    .await?;

    tracing::info!("facegated shutting down");
    Ok(())
}
