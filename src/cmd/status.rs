//! Status overview command.

use anyhow::Result;

use conductor::config::ConductorConfig;
use conductor::models::{QueueItemStatus, now_ms};

pub async fn cmd_status(config: &ConductorConfig) -> Result<()> {
    let db = super::open_db(config)?;
    let workers = db.call(|s| s.list_workers()).await?;
    let active_tasks = db.call(|s| s.count_running()).await?;
    let queued_tasks = db
        .call(|s| s.list_queue_items(Some(QueueItemStatus::Queued)))
        .await?
        .len();

    println!();
    println!("Conductor Status");
    println!("================");
    println!();
    println!("Workers:      {}", workers.len());
    println!("Active tasks: {}", active_tasks);
    println!("Queued tasks: {}", queued_tasks);

    if !workers.is_empty() {
        println!();
        println!("{:<16} {:<10} {:<8} Last heartbeat", "Worker", "Active", "Cap");
        let now = now_ms();
        for worker in &workers {
            let silent_s = now.saturating_sub(worker.last_heartbeat_ms) / 1_000;
            println!(
                "{:<16} {:<10} {:<8} {}",
                worker.id,
                worker.active_tasks.len(),
                worker.max_concurrent_tasks,
                console::style(format!("{}s ago", silent_s)).dim()
            );
        }
    }
    println!();
    Ok(())
}
