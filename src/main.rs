//! hooksync service entry point: run migrations, start the HTTP surface,
//! and optionally drive batches from an internal ticker.

use std::path::PathBuf;
use std::time::Duration;

use hooksync::config::{load_config, Config};
use hooksync::db::SyncDb;
use hooksync::error::StoreError;
use hooksync::hooks::notifier_from_config;
use hooksync::processors::ProcessorRegistry;
use hooksync::queue_manager::{run_batch, RunOptions};
use hooksync::server;
use hooksync::types::QueueType;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("Main: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = load_config()?;
    let db_path = config.resolved_db_path()?;

    // Open once before accepting traffic so migrations run exactly here
    SyncDb::open_at(&db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    log::info!("Main: database ready at {}", db_path.display());

    if let Some(interval_secs) = config.internal_scheduler_secs {
        spawn_internal_scheduler(config.clone(), db_path.clone(), interval_secs);
    }

    server::serve(config, db_path, ProcessorRegistry::new()).await
}

/// Fallback driver for deployments without an external scheduler: runs every
/// queue type in turn on a fixed interval.
fn spawn_internal_scheduler(config: Config, db_path: PathBuf, interval_secs: u64) {
    log::info!("Main: internal scheduler enabled, every {}s", interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;

            let config = config.clone();
            let db_path = db_path.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
                let db = SyncDb::open_at(&db_path)?;
                let registry = ProcessorRegistry::new();
                let notifier = notifier_from_config(&config);
                let opts = RunOptions::from_config(&config);
                for queue_type in QueueType::ALL {
                    run_batch(&db, &registry, notifier.as_ref(), queue_type, &opts)?;
                }
                Ok(())
            })
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Scheduler: run failed: {}", e),
                Err(e) => log::error!("Scheduler: task failed: {}", e),
            }
        }
    });
}
