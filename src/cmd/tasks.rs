//! Task creation, inspection, and phase lifecycle commands.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;

use conductor::claim::ClaimStore;
use conductor::config::ConductorConfig;
use conductor::coordinator::REQUIRED_CAPABILITY_KEY;
use conductor::lease::LeaseManager;
use conductor::machine::PhaseMachine;
use conductor::models::Task;
use conductor::phase::TaskPhase;

pub async fn cmd_task_add(
    config: &ConductorConfig,
    id: &str,
    title: &str,
    deps: &[String],
    capability: Option<&str>,
    priority: i64,
) -> Result<()> {
    let db = super::open_db(config)?;
    let mut task = Task::new(id, title);
    task.dependencies = deps.iter().cloned().collect();
    task.priority = priority;
    if let Some(cap) = capability {
        task.metadata
            .insert(REQUIRED_CAPABILITY_KEY.to_string(), cap.to_string());
    }
    let stored = task.clone();
    db.call(move |store| store.insert_task(&stored)).await?;
    println!("Created task {} at {}", task.id, task.current_phase);
    Ok(())
}

pub async fn cmd_task_list(config: &ConductorConfig) -> Result<()> {
    let db = super::open_db(config)?;
    let tasks = db.call(|s| s.list_tasks()).await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!();
    println!("{:<14} {:<12} {:<12} {:<12} Title", "Task", "Phase", "Status", "Worker");
    for task in &tasks {
        println!(
            "{:<14} {:<12} {:<12} {:<12} {}",
            task.id,
            task.current_phase.to_string(),
            console::style(task.coarse_status().to_string()).dim().to_string(),
            task.assigned_worker.as_deref().unwrap_or("-"),
            task.title
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_task_show(config: &ConductorConfig, id: &str) -> Result<()> {
    let db = super::open_db(config)?;
    let tid = id.to_string();
    let task = db
        .call(move |s| s.get_task(&tid))
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {} not found", id))?;

    println!();
    println!("Task {}", task.id);
    println!("  title:    {}", task.title);
    println!("  phase:    {}", task.current_phase);
    println!("  status:   {}", task.coarse_status());
    println!("  priority: {}", task.priority);
    if !task.dependencies.is_empty() {
        let deps: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
        println!("  deps:     {}", deps.join(", "));
    }
    if let Some(worker) = &task.assigned_worker {
        println!("  worker:   {}", worker);
    }
    for (key, value) in &task.metadata {
        println!("  {}: {}", key, value);
    }

    let claims = ClaimStore::new(db.clone());
    if let Some(owner) = claims.get_owner(id).await? {
        println!("  claim:    held by {}", owner);
    }
    let tid = id.to_string();
    if let Some(item) = db.call(move |s| s.get_open_queue_item(&tid)).await? {
        println!("  queue:    {} in {} lane", item.status, item.lane);
    }
    println!();
    Ok(())
}

pub async fn cmd_task_advance(
    config: &ConductorConfig,
    id: &str,
    phase: &str,
    actor: &str,
) -> Result<()> {
    let target = TaskPhase::from_str(phase)?;
    let db = super::open_db(config)?;
    let leases = Arc::new(LeaseManager::new(db.clone(), config.lease_config()));
    // No gates registered from the CLI; forward steps pass vacuously and
    // gated advancement stays with the worker processes.
    let machine = PhaseMachine::new(db.clone(), leases);

    let entry = machine.advance_phase(id, target, actor).await?;
    println!(
        "{} {} -> {} ({}) seq={}",
        id, entry.phase_from, entry.phase_to, entry.transition_type, entry.seq
    );
    Ok(())
}

pub async fn cmd_task_history(config: &ConductorConfig, id: &str) -> Result<()> {
    let db = super::open_db(config)?;
    let tid = id.to_string();
    let entries = db.call(move |s| s.ledger_entries(&tid)).await?;
    if entries.is_empty() {
        println!("No ledger entries for {}.", id);
        return Ok(());
    }

    println!();
    println!("{:<6} {:<12} {:<12} {:<10} {:<12} Hash", "Seq", "From", "To", "Type", "Actor");
    for entry in &entries {
        println!(
            "{:<6} {:<12} {:<12} {:<10} {:<12} {}",
            entry.seq,
            entry.phase_from.to_string(),
            entry.phase_to.to_string(),
            entry.transition_type.to_string(),
            entry.actor,
            console::style(&entry.this_hash[..12]).dim().to_string()
        );
        if !entry.evidence.is_empty() {
            println!("       evidence: {}", entry.evidence.join(", "));
        }
    }
    println!();
    Ok(())
}
