//! Policy authoring records

use super::common::StringUuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Named, versioned policy source owned by a tenant.
///
/// This is the authoring record; the evaluator works from whatever snapshot
/// was last loaded, which may trail `version`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Policy {
    pub id: StringUuid,
    pub tenant_id: StringUuid,
    pub name: String,
    pub description: Option<String>,
    /// Rego source text
    pub source: String,
    /// Starts at 1, +1 on every successful update
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Policy {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: StringUuid::new_v4(),
            tenant_id: StringUuid::nil(),
            name: String::new(),
            description: None,
            source: String::new(),
            version: 1,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for creating a policy
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePolicyInput {
    pub tenant_id: StringUuid,
    #[validate(length(min = 1, max = 100), custom(function = "validate_policy_name"))]
    pub name: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(length(min = 1))]
    pub source: String,
}

/// Input for updating a policy; `None` keeps the stored value
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdatePolicyInput {
    #[validate(length(min = 1, max = 100), custom(function = "validate_policy_name"))]
    pub name: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(length(min = 1))]
    pub source: Option<String>,
}

impl UpdatePolicyInput {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.source.is_none()
    }
}

fn validate_policy_name(name: &str) -> Result<(), validator::ValidationError> {
    if POLICY_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_policy_name"))
    }
}

lazy_static::lazy_static! {
    pub static ref POLICY_NAME_REGEX: regex::Regex =
        regex::Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap();
}
