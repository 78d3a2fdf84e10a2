use std::sync::Arc;

use anyhow::Result;
use taskschedule_core::TaskScheduleConfig;
use taskschedule_scheduler::{SchedulerEngine, SqliteStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the engine until Ctrl-C.
pub async fn run(store: SqliteStore, config: &TaskScheduleConfig, version: &str) -> Result<()> {
    info!(
        version,
        database = %config.database.path,
        interpreter = %config.runner.interpreter,
        "taskschedule starting"
    );

    let engine = SchedulerEngine::new(Arc::new(store), config);
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal.cancel();
    });

    engine.run(shutdown).await?;
    Ok(())
}
