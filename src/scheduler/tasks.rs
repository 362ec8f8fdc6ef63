use std::sync::Arc;

use tracing::info;

use crate::bot::App;
use crate::scheduler::Scheduler;

const HEARTBEAT_CRON: &str = "0 0 * * * *";

/// Register the session sweep and the hourly heartbeat
pub async fn register_builtin_tasks(
    scheduler: &mut Scheduler,
    app: Arc<App>,
    sweep_cron: &str,
) -> anyhow::Result<()> {
    let sweeper = Arc::clone(&app);
    scheduler
        .add_cron_job(sweep_cron, "session-sweep", move || {
            let app = Arc::clone(&sweeper);
            Box::pin(async move {
                app.sweep_sessions().await;
            })
        })
        .await?;

    scheduler
        .add_cron_job(HEARTBEAT_CRON, "heartbeat", move || {
            let app = Arc::clone(&app);
            Box::pin(async move {
                info!(
                    "Heartbeat: bot is alive, {} conversation(s) in progress",
                    app.active_conversations().await
                );
            })
        })
        .await?;

    Ok(())
}
