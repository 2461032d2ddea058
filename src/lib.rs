//! Tenant Authz - tenant-scoped RBAC authorization
//!
//! Tenants own roles, users hold roles inside tenants, and access checks are
//! answered by evaluating Rego policies either in-process or on a remote
//! policy service.

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod migration;
pub mod policy;
pub mod repository;
pub mod service;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, Result};
