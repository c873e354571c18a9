//! Multi-agent orchestration core.
//!
//! Tasks walk a fixed ten-phase lifecycle enforced by the [`machine`], with
//! every transition recorded in a tamper-evident hash chain ([`ledger`]),
//! serialized across worker processes by [`lease`]s and [`claim`]s, and
//! scheduled through a three-lane priority queue ([`dispatch`]). The
//! [`coordinator`] glues those pieces together for worker processes; task
//! business logic itself always lives outside this crate.

pub mod backoff;
pub mod claim;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod lease;
pub mod machine;
pub mod models;
pub mod phase;
