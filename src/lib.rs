//! Helmsman - fleet control plane for tenant container hosting
//!
//! "A steady hand on the tiller"
//!
//! Helmsman coordinates worker nodes running per-tenant containerized
//! workloads: it tracks node health over persistent channels, places and
//! live-migrates tenants, recovers them after node failure, and enforces a
//! credit-backed billing discipline gating the workload lifecycle.
//!
//! ## Subsystems
//!
//! - **Fabric**: per-node WebSocket channels, heartbeats up, commands down
//! - **Orchestrator**: liveness monitor, recovery, migration, orphan cleanup
//! - **Ledger**: append-only credit transactions with idempotent references
//! - **Billing**: the active/suspended/destroyed workload state machine
//! - **Snapshots**: backup records, key conventions, retention
//! - **Registry**: repositories over the relational store

pub mod billing;
pub mod config;
pub mod db;
pub mod events;
pub mod fabric;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod placement;
pub mod registry;
pub mod server;
pub mod services;
pub mod snapshots;
pub mod storage;
pub mod types;

pub use config::Args;
pub use services::Services;
pub use types::{HelmsmanError, Result};
