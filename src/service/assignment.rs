//! Assignment ledger: who holds which role in which tenant

use crate::cache::CacheOperations;
use crate::domain::{Role, StringUuid, TenantRoles, UserTenantRole};
use crate::error::{AppError, Entity, Result};
use crate::repository::{RbacRepository, TenantRepository, UserRepository};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct AssignmentLedger<R: RbacRepository, T: TenantRepository, U: UserRepository> {
    repo: Arc<R>,
    tenant_repo: Arc<T>,
    user_repo: Arc<U>,
    cache: Arc<dyn CacheOperations>,
}

impl<R: RbacRepository, T: TenantRepository, U: UserRepository> AssignmentLedger<R, T, U> {
    pub fn new(
        repo: Arc<R>,
        tenant_repo: Arc<T>,
        user_repo: Arc<U>,
        cache: Arc<dyn CacheOperations>,
    ) -> Self {
        Self {
            repo,
            tenant_repo,
            user_repo,
            cache,
        }
    }

    async fn invalidate(&self, user_id: StringUuid, tenant_id: StringUuid) {
        if let Err(e) = self
            .cache
            .invalidate_user_roles(user_id, Some(tenant_id))
            .await
        {
            warn!(user_id = %user_id, tenant_id = %tenant_id, error = %e, "Failed to invalidate role cache");
        }
    }

    /// Bind `role_id` to the user inside `tenant_id`.
    ///
    /// The role must be owned by that tenant; the same triple cannot be
    /// assigned twice.
    pub async fn assign(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<UserTenantRole> {
        if self.user_repo.find_by_id(user_id).await?.is_none() {
            return Err(AppError::not_found(Entity::User, user_id));
        }
        if self.tenant_repo.find_by_id(tenant_id).await?.is_none() {
            return Err(AppError::not_found(Entity::Tenant, tenant_id));
        }
        let role = self
            .repo
            .find_role_by_id(role_id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Role, role_id))?;

        if !role.belongs_to(tenant_id) {
            return Err(AppError::TenantMismatch { role_id, tenant_id });
        }

        let assignment = self
            .repo
            .create_assignment(user_id, tenant_id, role_id)
            .await?;
        self.invalidate(user_id, tenant_id).await;

        info!(user_id = %user_id, tenant_id = %tenant_id, role = %role.name, "Role assigned");
        Ok(assignment)
    }

    /// Returns whether an assignment was removed; revoking nothing is not an error
    pub async fn revoke(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<bool> {
        let removed = self
            .repo
            .delete_assignment(user_id, tenant_id, role_id)
            .await?;
        // Invalidate even when nothing was removed: a stale entry may still be cached
        self.invalidate(user_id, tenant_id).await;

        if removed {
            info!(user_id = %user_id, tenant_id = %tenant_id, role_id = %role_id, "Role revoked");
        }
        Ok(removed)
    }

    /// Roles the user holds in the tenant, oldest assignment first
    pub async fn roles_for(&self, user_id: StringUuid, tenant_id: StringUuid) -> Result<Vec<Role>> {
        match self.cache.get_user_roles(user_id, tenant_id).await {
            Ok(Some(roles)) => {
                debug!(user_id = %user_id, tenant_id = %tenant_id, "Role cache hit");
                return Ok(roles);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Role cache read failed, falling back to database"),
        }

        // Taken before the read so a revoke landing in between voids the fill
        let token = match self.cache.user_roles_fill_token(user_id, tenant_id).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Role cache unavailable, skipping fill");
                None
            }
        };

        let roles = self
            .repo
            .find_user_roles_in_tenant(user_id, tenant_id)
            .await?;

        if let Some(token) = token {
            match self
                .cache
                .set_user_roles(user_id, tenant_id, &roles, token)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(user_id = %user_id, tenant_id = %tenant_id, "Role cache fill superseded by invalidation")
                }
                Err(e) => warn!(error = %e, "Failed to cache user roles"),
            }
        }
        Ok(roles)
    }

    /// The user's roles grouped by tenant
    pub async fn roles_for_across_tenants(&self, user_id: StringUuid) -> Result<Vec<TenantRoles>> {
        let rows = self.repo.find_user_roles_across_tenants(user_id).await?;

        let mut grouped: Vec<TenantRoles> = Vec::new();
        for (tenant_id, role) in rows {
            if let Some(group) = grouped.iter_mut().find(|g| g.tenant.id == tenant_id) {
                group.roles.push(role);
                continue;
            }
            // The row join guarantees the tenant exists, but it may have been
            // deleted since.
            let Some(tenant) = self.tenant_repo.find_by_id(tenant_id).await? else {
                continue;
            };
            grouped.push(TenantRoles {
                tenant,
                roles: vec![role],
            });
        }
        Ok(grouped)
    }

    pub async fn users_with_role(
        &self,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<Vec<StringUuid>> {
        let role = self
            .repo
            .find_role_by_id(role_id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Role, role_id))?;
        if !role.belongs_to(tenant_id) {
            return Err(AppError::TenantMismatch { role_id, tenant_id });
        }

        self.repo.find_users_with_role(tenant_id, role_id).await
    }

    pub async fn has_role(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<bool> {
        Ok(self
            .repo
            .find_assignment(user_id, tenant_id, role_id)
            .await?
            .is_some())
    }
}
