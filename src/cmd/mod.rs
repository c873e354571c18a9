//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `project` | `Init`                                    |
//! | `status`  | `Status`                                  |
//! | `tasks`   | `Tasks` (add/list/show/advance/history)   |
//! | `queue`   | `Queue` (dispatch/list/next/start/...)    |
//! | `verify`  | `Verify`                                  |

use std::sync::Arc;

use anyhow::Result;

use conductor::claim::ClaimStore;
use conductor::config::ConductorConfig;
use conductor::db::{DbHandle, Store};
use conductor::dispatch::PriorityDispatcher;
use conductor::lease::LeaseManager;

pub mod project;
pub mod queue;
pub mod status;
pub mod tasks;
pub mod verify;

pub use project::cmd_init;
pub use queue::{
    cmd_queue_cancel, cmd_queue_check, cmd_queue_complete, cmd_queue_dispatch, cmd_queue_list,
    cmd_queue_next, cmd_queue_start,
};
pub use status::cmd_status;
pub use tasks::{cmd_task_add, cmd_task_advance, cmd_task_history, cmd_task_list, cmd_task_show};
pub use verify::cmd_verify;

/// Open the shared database, refusing politely when init has not run.
pub(crate) fn open_db(config: &ConductorConfig) -> Result<DbHandle> {
    let path = config.db_path();
    if !path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'conductor init' first.",
            path.display()
        );
    }
    Ok(DbHandle::new(Store::open(&path)?))
}

/// Build the dispatcher stack over an open database.
pub(crate) fn build_dispatcher(config: &ConductorConfig, db: &DbHandle) -> PriorityDispatcher {
    let leases = Arc::new(LeaseManager::new(db.clone(), config.lease_config()));
    let claims = Arc::new(ClaimStore::new(db.clone()));
    PriorityDispatcher::new(db.clone(), leases, claims, config.dispatcher_config())
}
