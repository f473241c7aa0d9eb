//! Control plane core for multi-tenant database clusters
//!
//! This crate provides:
//! - Placement scheduling: candidate filters, plan matching and admission
//! - A polling task executor with per-key cancellation
//! - The orchestration engine for deploy, delete, resize, rebuild, migrate,
//!   backup and restore
//! - Job reconciliation for backup jobs
//! - Health checks and observability

pub mod catalog;
pub mod engine;
pub mod error;
pub mod health;
pub mod jobs;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod wait;

pub use error::{Error, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PlaneMetrics, StructuredLogger};
