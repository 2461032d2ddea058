//! RBAC (Role-Based Access Control) domain models

use super::common::StringUuid;
use super::tenant::Tenant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use validator::Validate;

/// One grant inside a role: the actions allowed on a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermission {
    pub resource: String,
    pub actions: BTreeSet<String>,
}

impl RolePermission {
    pub fn new<I, S>(resource: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource: resource.into(),
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.resource == resource && self.actions.contains(action)
    }
}

/// Role entity, scoped to exactly one tenant
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: StringUuid,
    pub tenant_id: StringUuid,
    /// Human-readable name; the only role identifier policies ever see
    pub name: String,
    pub description: Option<String>,
    /// Ordered permission list
    #[sqlx(json)]
    pub permissions: Vec<RolePermission>,
    /// System roles cannot be renamed or deleted through ordinary operations
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Role {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: StringUuid::new_v4(),
            tenant_id: StringUuid::nil(),
            name: String::new(),
            description: None,
            permissions: Vec::new(),
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Role {
    pub fn belongs_to(&self, tenant_id: StringUuid) -> bool {
        self.tenant_id == tenant_id
    }
}

/// User-Tenant-Role assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserTenantRole {
    pub user_id: StringUuid,
    pub tenant_id: StringUuid,
    pub role_id: StringUuid,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a role
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRoleInput {
    pub tenant_id: StringUuid,
    #[validate(length(min = 1, max = 100), custom(function = "validate_role_name"))]
    pub name: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(custom(function = "validate_permissions"))]
    pub permissions: Vec<RolePermission>,
    #[serde(default)]
    pub is_system: bool,
}

/// Input for updating a role; `None` keeps the stored value
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateRoleInput {
    #[validate(length(min = 1, max = 100), custom(function = "validate_role_name"))]
    pub name: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(custom(function = "validate_permissions"))]
    pub permissions: Option<Vec<RolePermission>>,
}

/// A tenant together with the roles a user holds in it
#[derive(Debug, Clone, Serialize)]
pub struct TenantRoles {
    pub tenant: Tenant,
    pub roles: Vec<Role>,
}

fn validate_role_name(name: &str) -> Result<(), validator::ValidationError> {
    if ROLE_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_role_name"))
    }
}

fn validate_permissions(permissions: &[RolePermission]) -> Result<(), validator::ValidationError> {
    for permission in permissions {
        if permission.resource.trim().is_empty() {
            return Err(validator::ValidationError::new("empty_permission_resource"));
        }
        if permission.actions.is_empty() || permission.actions.iter().any(|a| a.trim().is_empty())
        {
            return Err(validator::ValidationError::new("invalid_permission_actions"));
        }
    }
    Ok(())
}

lazy_static::lazy_static! {
    pub static ref ROLE_NAME_REGEX: regex::Regex =
        regex::Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap();
}
