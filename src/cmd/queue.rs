//! Dispatch queue commands.

use std::str::FromStr;

use anyhow::Result;

use conductor::config::ConductorConfig;
use conductor::dispatch::DispatchRequest;
use conductor::models::{QueueItemStatus, QueueLane, now_ms};

pub async fn cmd_queue_dispatch(
    config: &ConductorConfig,
    task_id: &str,
    lane: Option<&str>,
    interactive: bool,
    critical: bool,
    estimated_ms: Option<i64>,
) -> Result<()> {
    let db = super::open_db(config)?;
    let tid = task_id.to_string();
    if db.call(move |s| s.get_task(&tid)).await?.is_none() {
        anyhow::bail!("task {} not found; add it with 'conductor tasks add'", task_id);
    }

    let dispatcher = super::build_dispatcher(config, &db);
    let request = DispatchRequest {
        task_id: task_id.to_string(),
        lane: lane.map(QueueLane::from_str).transpose()?,
        interactive,
        critical,
        estimated_duration_ms: estimated_ms,
    };
    let item = dispatcher.dispatch_task(request).await?;
    println!(
        "Enqueued {} in {} lane ({})",
        item.task_id, item.lane, item.priority_source
    );
    Ok(())
}

pub async fn cmd_queue_list(config: &ConductorConfig, status: Option<&str>) -> Result<()> {
    let db = super::open_db(config)?;
    let filter = status.map(QueueItemStatus::from_str).transpose()?;
    let items = db.call(move |s| s.list_queue_items(filter)).await?;
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!();
    println!("{:<14} {:<12} {:<11} {:<12} Waited", "Task", "Lane", "Status", "Source");
    let now = now_ms();
    for item in &items {
        println!(
            "{:<14} {:<12} {:<11} {:<12} {}ms",
            item.task_id,
            item.lane.to_string(),
            item.status.to_string(),
            item.priority_source.to_string(),
            item.queued_age_ms(now)
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_queue_next(config: &ConductorConfig, max: usize) -> Result<()> {
    let db = super::open_db(config)?;
    let dispatcher = super::build_dispatcher(config, &db);
    let batch = dispatcher.get_next_batch(max).await?;
    if batch.is_empty() {
        println!("Nothing eligible to start.");
        return Ok(());
    }
    for item in &batch {
        println!("{} ({} lane)", item.task_id, item.lane);
    }
    Ok(())
}

pub async fn cmd_queue_start(config: &ConductorConfig, task_id: &str) -> Result<()> {
    let db = super::open_db(config)?;
    let dispatcher = super::build_dispatcher(config, &db);
    let item = dispatcher.start_task(task_id).await?;
    println!("Started {} in {} lane", item.task_id, item.lane);
    Ok(())
}

pub async fn cmd_queue_complete(
    config: &ConductorConfig,
    task_id: &str,
    duration_ms: Option<i64>,
    notes: Option<String>,
) -> Result<()> {
    let db = super::open_db(config)?;
    let dispatcher = super::build_dispatcher(config, &db);
    let item = dispatcher.complete_task(task_id, duration_ms, notes).await?;
    match item.duration_ms {
        Some(ms) => println!("Completed {} in {}ms", item.task_id, ms),
        None => println!("Completed {}", item.task_id),
    }
    Ok(())
}

pub async fn cmd_queue_cancel(config: &ConductorConfig, task_id: &str, reason: &str) -> Result<()> {
    let db = super::open_db(config)?;
    let dispatcher = super::build_dispatcher(config, &db);
    dispatcher.cancel_task(task_id, reason).await?;
    println!("Cancelled {}: {}", task_id, reason);
    Ok(())
}

pub async fn cmd_queue_check(config: &ConductorConfig) -> Result<()> {
    let db = super::open_db(config)?;
    let dispatcher = super::build_dispatcher(config, &db);
    let report = dispatcher.verify_interactive_priority().await?;

    println!(
        "Urgent lane: {}/{} running",
        report.urgent_running, report.urgent_limit
    );
    if report.ok() {
        println!("{}", console::style("Interactive priority OK").green());
        return Ok(());
    }
    if report.saturated {
        println!(
            "{}",
            console::style("Urgent lane saturated while urgent work waits").yellow()
        );
    }
    for item in &report.overdue {
        println!(
            "{}",
            console::style(format!(
                "Urgent task {} waiting {}ms",
                item.task_id,
                item.queued_age_ms(now_ms())
            ))
            .red()
        );
    }
    Ok(())
}
