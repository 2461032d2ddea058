//! Evaluation input and aggregated access decisions

use super::common::StringUuid;
use super::rbac::Role;
use serde::{Deserialize, Serialize};

/// What a policy sees for one (role, resource, action, tenant) request.
///
/// Both evaluator modes receive exactly this document as `input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationInput {
    /// Role name, never its internal id
    pub role: String,
    pub resource: String,
    pub action: String,
    pub tenant_id: StringUuid,
}

impl EvaluationInput {
    pub fn project(role: &Role, resource: &str, action: &str, tenant_id: StringUuid) -> Self {
        Self {
            role: role.name.clone(),
            resource: resource.to_string(),
            action: action.to_string(),
            tenant_id,
        }
    }
}

/// Verdict contributed by one held role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleVerdict {
    pub role_id: StringUuid,
    pub role_name: String,
    pub allowed: bool,
}

/// A role whose evaluation failed and was counted as not allowing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleFailure {
    pub role_id: StringUuid,
    pub error: String,
}

/// Aggregated result of one access check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub considered_roles: Vec<RoleVerdict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RoleFailure>,
}

impl Decision {
    pub fn deny() -> Self {
        Self::default()
    }

    /// Any-of aggregation: a single allowing role is enough
    pub fn aggregate(considered_roles: Vec<RoleVerdict>, failures: Vec<RoleFailure>) -> Self {
        let allowed = considered_roles.iter().any(|v| v.allowed);
        Self {
            allowed,
            considered_roles,
            failures,
        }
    }

    /// The decision as shown to callers who may not inspect role detail
    pub fn redacted(&self) -> Self {
        Self {
            allowed: self.allowed,
            considered_roles: Vec::new(),
            failures: Vec::new(),
        }
    }
}
