//! Project initialization.

use anyhow::{Context, Result};

use conductor::config::{CONFIG_FILE, ConductorConfig};
use conductor::db::Store;

pub fn cmd_init(config: &ConductorConfig) -> Result<()> {
    let data_dir = &config.store.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let db_path = config.db_path();
    let already = db_path.exists();
    Store::open(&db_path)?;

    // Starter config beside the database; never clobber an existing one.
    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        config.save(&config_path)?;
        println!("Wrote {}", config_path.display());
    }

    if already {
        println!("Database already initialized at {}", db_path.display());
    } else {
        println!("Initialized database at {}", db_path.display());
    }
    Ok(())
}
