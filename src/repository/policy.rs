//! Policy repository

use crate::domain::{CreatePolicyInput, Policy, StringUuid, UpdatePolicyInput};
use crate::error::{conflict_on_unique, AppError, Entity, Result};
use async_trait::async_trait;
use sqlx::MySqlPool;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn create(&self, input: &CreatePolicyInput) -> Result<Policy>;
    async fn find_by_id(&self, id: StringUuid) -> Result<Option<Policy>>;
    async fn find_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Option<Policy>>;
    async fn list_by_tenant(&self, tenant_id: StringUuid) -> Result<Vec<Policy>>;
    /// Active policies of tenants that still exist
    async fn list_active(&self) -> Result<Vec<Policy>>;
    /// Apply `input` and bump the version by one
    async fn update(&self, id: StringUuid, input: &UpdatePolicyInput) -> Result<Policy>;
    async fn set_active(&self, id: StringUuid, active: bool) -> Result<Policy>;
    async fn delete(&self, id: StringUuid) -> Result<()>;
}

const POLICY_COLUMNS: &str = "p.id, p.tenant_id, p.name, p.description, p.source, p.version, \
                              p.is_active, p.created_at, p.updated_at";

pub struct PolicyRepositoryImpl {
    pool: MySqlPool,
}

impl PolicyRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRepository for PolicyRepositoryImpl {
    async fn create(&self, input: &CreatePolicyInput) -> Result<Policy> {
        let id = StringUuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO policies (id, tenant_id, name, description, source, version, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, TRUE, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.source)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("Policy '{}' already exists in this tenant", input.name)
            })
        })?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to create policy")))
    }

    async fn find_by_id(&self, id: StringUuid) -> Result<Option<Policy>> {
        let sql = format!("SELECT {} FROM policies p WHERE p.id = ?", POLICY_COLUMNS);
        let policy = sqlx::query_as::<_, Policy>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(policy)
    }

    async fn find_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Option<Policy>> {
        let sql = format!(
            "SELECT {} FROM policies p WHERE p.tenant_id = ? AND p.name = ?",
            POLICY_COLUMNS
        );
        let policy = sqlx::query_as::<_, Policy>(&sql)
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(policy)
    }

    async fn list_by_tenant(&self, tenant_id: StringUuid) -> Result<Vec<Policy>> {
        let sql = format!(
            "SELECT {} FROM policies p WHERE p.tenant_id = ? ORDER BY p.name",
            POLICY_COLUMNS
        );
        let policies = sqlx::query_as::<_, Policy>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(policies)
    }

    async fn list_active(&self) -> Result<Vec<Policy>> {
        let sql = format!(
            "SELECT {} FROM policies p INNER JOIN tenants t ON t.id = p.tenant_id \
             WHERE p.is_active = TRUE ORDER BY p.tenant_id, p.name",
            POLICY_COLUMNS
        );
        let policies = sqlx::query_as::<_, Policy>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(policies)
    }

    async fn update(&self, id: StringUuid, input: &UpdatePolicyInput) -> Result<Policy> {
        let existing = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Policy, id))?;

        let name = input.name.as_ref().unwrap_or(&existing.name);
        let description = input.description.as_ref().or(existing.description.as_ref());
        let source = input.source.as_ref().unwrap_or(&existing.source);

        sqlx::query(
            r#"
            UPDATE policies
            SET name = ?, description = ?, source = ?, version = version + 1, updated_at = NOW()
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(source)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("Policy '{}' already exists in this tenant", name)
            })
        })?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to update policy")))
    }

    async fn set_active(&self, id: StringUuid, active: bool) -> Result<Policy> {
        let result = sqlx::query("UPDATE policies SET is_active = ?, updated_at = NOW() WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        // MySQL reports 0 affected rows when the flag already had this value
        if result.rows_affected() == 0 {
            return self
                .find_by_id(id)
                .await?
                .ok_or_else(|| AppError::not_found(Entity::Policy, id));
        }

        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to update policy")))
    }

    async fn delete(&self, id: StringUuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM policies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(Entity::Policy, id));
        }

        Ok(())
    }
}
