//! Ledger chain verification command.

use anyhow::Result;

use conductor::config::ConductorConfig;

pub async fn cmd_verify(config: &ConductorConfig, task_id: &str) -> Result<()> {
    let db = super::open_db(config)?;
    let tid = task_id.to_string();
    let entries = db.call(move |s| s.ledger_entries(&tid)).await?;
    if entries.is_empty() {
        println!("No ledger entries for {}.", task_id);
        return Ok(());
    }

    let tid = task_id.to_string();
    let verification = db.call(move |s| s.ledger_verify_chain(&tid)).await?;
    let tid = task_id.to_string();
    let reworks = db.call(move |s| s.ledger_rework_count(&tid)).await?;

    if verification.valid {
        println!(
            "{}",
            console::style(format!(
                "Chain verified: {} entries, {} backtracks",
                entries.len(),
                reworks
            ))
            .green()
        );
        Ok(())
    } else {
        anyhow::bail!(
            "ledger corruption for task {} at sequence {}",
            task_id,
            verification.broken_at.unwrap_or(0)
        )
    }
}
