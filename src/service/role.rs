//! Role catalog: per-tenant named roles and their permissions

use crate::cache::CacheOperations;
use crate::domain::{CreateRoleInput, Role, StringUuid, UpdateRoleInput};
use crate::error::{AppError, Entity, Result};
use crate::repository::{RbacRepository, TenantRepository};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

pub struct RoleCatalog<R: RbacRepository, T: TenantRepository> {
    repo: Arc<R>,
    tenant_repo: Arc<T>,
    cache: Arc<dyn CacheOperations>,
}

impl<R: RbacRepository, T: TenantRepository> RoleCatalog<R, T> {
    pub fn new(repo: Arc<R>, tenant_repo: Arc<T>, cache: Arc<dyn CacheOperations>) -> Self {
        Self {
            repo,
            tenant_repo,
            cache,
        }
    }

    async fn ensure_tenant(&self, tenant_id: StringUuid) -> Result<()> {
        self.tenant_repo
            .find_by_id(tenant_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| AppError::not_found(Entity::Tenant, tenant_id))
    }

    async fn invalidate_cache(&self) {
        if let Err(e) = self.cache.invalidate_all_user_roles().await {
            warn!(error = %e, "Failed to invalidate role cache");
        }
    }

    pub async fn create_role(&self, input: CreateRoleInput) -> Result<Role> {
        input.validate()?;
        self.ensure_tenant(input.tenant_id).await?;

        if self
            .repo
            .find_role_by_name(input.tenant_id, &input.name)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "Role '{}' already exists in this tenant",
                input.name
            )));
        }

        let role = self.repo.create_role(&input).await?;
        info!(role_id = %role.id, tenant_id = %role.tenant_id, name = %role.name, "Role created");
        Ok(role)
    }

    pub async fn get_role(&self, id: StringUuid) -> Result<Role> {
        self.repo
            .find_role_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Role, id))
    }

    pub async fn find_role_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Role> {
        self.repo
            .find_role_by_name(tenant_id, name)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Role, name))
    }

    pub async fn list_roles(&self, tenant_id: StringUuid) -> Result<Vec<Role>> {
        self.ensure_tenant(tenant_id).await?;
        self.repo.find_roles_by_tenant(tenant_id).await
    }

    pub async fn update_role(&self, id: StringUuid, input: UpdateRoleInput) -> Result<Role> {
        input.validate()?;
        let existing = self.get_role(id).await?;

        if existing.is_system {
            if let Some(name) = &input.name {
                if name != &existing.name {
                    return Err(AppError::Forbidden(format!(
                        "System role '{}' cannot be renamed",
                        existing.name
                    )));
                }
            }
        }

        if let Some(name) = &input.name {
            if name != &existing.name
                && self
                    .repo
                    .find_role_by_name(existing.tenant_id, name)
                    .await?
                    .is_some()
            {
                return Err(AppError::Conflict(format!(
                    "Role '{}' already exists in this tenant",
                    name
                )));
            }
        }

        let role = self.repo.update_role(id, &input).await?;
        self.invalidate_cache().await;
        Ok(role)
    }

    /// Delete a role together with every assignment of it
    pub async fn delete_role(&self, id: StringUuid) -> Result<()> {
        let role = self.get_role(id).await?;
        if role.is_system {
            return Err(AppError::Forbidden(format!(
                "System role '{}' cannot be deleted",
                role.name
            )));
        }

        self.repo.delete_role(id).await?;
        self.invalidate_cache().await;
        info!(role_id = %id, tenant_id = %role.tenant_id, "Role deleted");
        Ok(())
    }
}
