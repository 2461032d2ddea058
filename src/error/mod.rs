//! Unified error handling for Tenant Authz

use crate::domain::StringUuid;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Entity kinds that can be reported missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Tenant,
    User,
    Role,
    Policy,
    Assignment,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Tenant => write!(f, "Tenant"),
            Entity::User => write!(f, "User"),
            Entity::Role => write!(f, "Role"),
            Entity::Policy => write!(f, "Policy"),
            Entity::Assignment => write!(f, "Assignment"),
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0} {1}")]
    NotFound(Entity, String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Tenant mismatch: role {role_id} does not belong to tenant {tenant_id}")]
    TenantMismatch {
        role_id: StringUuid,
        tenant_id: StringUuid,
    },

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Policy not loaded: {0}")]
    PolicyNotFound(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Access check cancelled")]
    Cancelled,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(entity: Entity, id: impl std::fmt::Display) -> Self {
        AppError::NotFound(entity, id.to_string())
    }

    /// Stable machine-readable error code
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(..) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::TenantMismatch { .. } => "tenant_mismatch",
            AppError::InvalidPolicy(_) => "invalid_policy",
            AppError::PolicyNotFound(_) => "policy_not_found",
            AppError::Evaluation(_) => "evaluation_error",
            AppError::Cancelled => "cancelled",
            AppError::Forbidden(_) => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database_error",
            AppError::Redis(_) => "cache_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// True when the failure says nothing about whether access should be granted.
    ///
    /// Monitoring uses this to separate "policy says no" from "engine is down".
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            AppError::Evaluation(_)
                | AppError::PolicyNotFound(_)
                | AppError::Cancelled
                | AppError::Database(_)
                | AppError::Redis(_)
                | AppError::Internal(_)
        )
    }

    /// Message safe to show a non-administrative caller.
    ///
    /// Never names the policy, the backend or the role that failed.
    pub fn public_message(&self) -> String {
        match self {
            AppError::NotFound(entity, _) => format!("{} not found", entity),
            AppError::Conflict(msg) => msg.clone(),
            AppError::TenantMismatch { .. } => {
                "Role does not belong to the specified tenant".to_string()
            }
            AppError::InvalidPolicy(msg) => format!("Invalid policy: {}", msg),
            AppError::Forbidden(msg) => msg.clone(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Cancelled => "Authorization check was cancelled".to_string(),
            AppError::PolicyNotFound(_) | AppError::Evaluation(_) => {
                tracing::error!(error = %self, "authorization engine failure");
                "Authorization is temporarily unavailable".to_string()
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "A database error occurred".to_string()
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {:?}", e);
                "A cache error occurred".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                "An internal error occurred".to_string()
            }
        }
    }
}

// Conversion from validation errors
impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Map a unique-index violation to `Conflict`, passing every other error through.
pub(crate) fn conflict_on_unique(err: sqlx::Error, message: impl FnOnce() -> String) -> AppError {
    let is_unique = err
        .as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false);
    if is_unique {
        AppError::Conflict(message())
    } else {
        AppError::Database(err)
    }
}
