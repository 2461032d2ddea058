//! Tenant directory and user registry

use crate::cache::CacheOperations;
use crate::domain::{CreateTenantInput, CreateUserInput, StringUuid, Tenant, User};
use crate::error::{AppError, Entity, Result};
use crate::repository::{TenantRepository, UserRepository};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

pub struct TenantService<R: TenantRepository, U: UserRepository> {
    repo: Arc<R>,
    user_repo: Arc<U>,
    cache: Arc<dyn CacheOperations>,
}

impl<R: TenantRepository, U: UserRepository> TenantService<R, U> {
    pub fn new(repo: Arc<R>, user_repo: Arc<U>, cache: Arc<dyn CacheOperations>) -> Self {
        Self {
            repo,
            user_repo,
            cache,
        }
    }

    // ==================== Tenants ====================

    pub async fn create_tenant(&self, input: CreateTenantInput) -> Result<Tenant> {
        input.validate()?;

        if self.repo.find_by_name(&input.name).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "Tenant '{}' already exists",
                input.name
            )));
        }

        let tenant = self.repo.create(&input).await?;
        info!(tenant_id = %tenant.id, name = %tenant.name, "Tenant created");
        Ok(tenant)
    }

    pub async fn get_tenant(&self, id: StringUuid) -> Result<Tenant> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Tenant, id))
    }

    pub async fn find_tenant_by_name(&self, name: &str) -> Result<Option<Tenant>> {
        self.repo.find_by_name(name).await
    }

    pub async fn tenant_exists(&self, id: StringUuid) -> Result<bool> {
        Ok(self.repo.find_by_id(id).await?.is_some())
    }

    pub async fn list_tenants(&self, page: i64, per_page: i64) -> Result<Vec<Tenant>> {
        let per_page = per_page.clamp(1, 100);
        let offset = (page.max(1) - 1) * per_page;
        self.repo.list(offset, per_page).await
    }

    /// Remove the tenant row.
    ///
    /// Roles, assignments and policies of the tenant stay in storage but can
    /// never grant access again: role resolution joins on the tenant and access
    /// checks require it to exist.
    pub async fn delete_tenant(&self, id: StringUuid) -> Result<()> {
        let _ = self.get_tenant(id).await?;
        self.repo.delete(id).await?;

        if let Err(e) = self.cache.invalidate_all_user_roles().await {
            warn!(error = %e, "Failed to invalidate role cache after tenant delete");
        }
        info!(tenant_id = %id, "Tenant deleted");
        Ok(())
    }

    // ==================== Users ====================

    pub async fn create_user(&self, input: CreateUserInput) -> Result<User> {
        input.validate()?;

        let email = input.normalized_email();
        if self.user_repo.find_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict(format!("User '{}' already exists", email)));
        }

        self.user_repo.create(&input).await
    }

    pub async fn get_user(&self, id: StringUuid) -> Result<User> {
        self.user_repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::User, id))
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.user_repo
            .find_by_email(&email.trim().to_lowercase())
            .await
    }

    pub async fn user_exists(&self, id: StringUuid) -> Result<bool> {
        Ok(self.user_repo.find_by_id(id).await?.is_some())
    }
}
