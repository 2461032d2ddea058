//! Tenant domain model

use super::common::StringUuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Tenant entity: the isolation boundary for roles, policies and assignments
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: StringUuid,
    /// Globally unique display name
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Tenant {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: StringUuid::new_v4(),
            name: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for provisioning a tenant
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateTenantInput {
    #[validate(length(min = 1, max = 255), custom(function = "validate_tenant_name"))]
    pub name: String,
}

fn validate_tenant_name(name: &str) -> Result<(), validator::ValidationError> {
    if name.trim() == name {
        Ok(())
    } else {
        Err(validator::ValidationError::new("untrimmed_tenant_name"))
    }
}
