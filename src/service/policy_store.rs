//! Policy store: authoring records for tenant policies

use crate::domain::{CreatePolicyInput, Policy, StringUuid, UpdatePolicyInput};
use crate::error::{AppError, Entity, Result};
use crate::policy::{check_package_scope, package_of, PolicyEvaluator};
use crate::repository::{PolicyRepository, TenantRepository};
use std::sync::Arc;
use tracing::info;
use validator::Validate;

/// Policy CRUD. Source text is checked by the evaluator before any write and
/// must declare a package inside the owning tenant's namespace; nothing here
/// touches the loaded snapshot.
pub struct PolicyStore<P: PolicyRepository, T: TenantRepository, E: PolicyEvaluator> {
    repo: Arc<P>,
    tenant_repo: Arc<T>,
    evaluator: Arc<E>,
}

impl<P: PolicyRepository, T: TenantRepository, E: PolicyEvaluator> PolicyStore<P, T, E> {
    pub fn new(repo: Arc<P>, tenant_repo: Arc<T>, evaluator: Arc<E>) -> Self {
        Self {
            repo,
            tenant_repo,
            evaluator,
        }
    }

    fn check_source(&self, tenant_id: StringUuid, source: &str) -> Result<()> {
        self.evaluator.validate(source)?;
        check_package_scope(Some(tenant_id), &package_of(source)?)
    }

    pub async fn create(&self, input: CreatePolicyInput) -> Result<Policy> {
        input.validate()?;
        if self.tenant_repo.find_by_id(input.tenant_id).await?.is_none() {
            return Err(AppError::not_found(Entity::Tenant, input.tenant_id));
        }
        self.check_source(input.tenant_id, &input.source)?;

        if self
            .repo
            .find_by_name(input.tenant_id, &input.name)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "Policy '{}' already exists in this tenant",
                input.name
            )));
        }

        let policy = self.repo.create(&input).await?;
        info!(
            policy_id = %policy.id,
            tenant_id = %policy.tenant_id,
            name = %policy.name,
            "Policy created"
        );
        Ok(policy)
    }

    pub async fn get(&self, id: StringUuid) -> Result<Policy> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Policy, id))
    }

    pub async fn get_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Policy> {
        self.repo
            .find_by_name(tenant_id, name)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Policy, name))
    }

    pub async fn list(&self, tenant_id: StringUuid) -> Result<Vec<Policy>> {
        if self.tenant_repo.find_by_id(tenant_id).await?.is_none() {
            return Err(AppError::not_found(Entity::Tenant, tenant_id));
        }
        self.repo.list_by_tenant(tenant_id).await
    }

    /// Apply an edit; the stored version goes up by exactly one
    pub async fn update(&self, id: StringUuid, input: UpdatePolicyInput) -> Result<Policy> {
        input.validate()?;
        if input.is_empty() {
            return Err(AppError::Validation("No policy fields to update".to_string()));
        }

        let existing = self.get(id).await?;
        if let Some(source) = &input.source {
            self.check_source(existing.tenant_id, source)?;
        }

        if let Some(name) = &input.name {
            if name != &existing.name
                && self
                    .repo
                    .find_by_name(existing.tenant_id, name)
                    .await?
                    .is_some()
            {
                return Err(AppError::Conflict(format!(
                    "Policy '{}' already exists in this tenant",
                    name
                )));
            }
        }

        let policy = self.repo.update(id, &input).await?;
        info!(policy_id = %id, version = policy.version, "Policy updated");
        Ok(policy)
    }

    /// Toggle whether the policy is part of the next load; the version is unchanged
    pub async fn set_active(&self, id: StringUuid, active: bool) -> Result<Policy> {
        let _ = self.get(id).await?;
        self.repo.set_active(id, active).await
    }

    pub async fn delete(&self, id: StringUuid) -> Result<()> {
        let _ = self.get(id).await?;
        self.repo.delete(id).await?;
        info!(policy_id = %id, "Policy deleted");
        Ok(())
    }
}
