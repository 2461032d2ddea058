//! RBAC repository: role catalog and user-tenant-role assignments

use crate::domain::{CreateRoleInput, Role, StringUuid, UpdateRoleInput, UserTenantRole};
use crate::error::{conflict_on_unique, AppError, Entity, Result};
use async_trait::async_trait;
use sqlx::{FromRow, MySqlPool};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RbacRepository: Send + Sync {
    // Roles
    async fn create_role(&self, input: &CreateRoleInput) -> Result<Role>;
    async fn find_role_by_id(&self, id: StringUuid) -> Result<Option<Role>>;
    async fn find_role_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Option<Role>>;
    async fn find_roles_by_tenant(&self, tenant_id: StringUuid) -> Result<Vec<Role>>;
    async fn find_all_roles(&self) -> Result<Vec<Role>>;
    async fn update_role(&self, id: StringUuid, input: &UpdateRoleInput) -> Result<Role>;
    async fn delete_role(&self, id: StringUuid) -> Result<()>;

    // User-Tenant-Role
    async fn create_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<UserTenantRole>;
    async fn delete_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<bool>;
    async fn find_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<Option<UserTenantRole>>;
    async fn find_user_roles_in_tenant(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<Vec<Role>>;
    async fn find_user_roles_across_tenants(
        &self,
        user_id: StringUuid,
    ) -> Result<Vec<(StringUuid, Role)>>;
    async fn find_users_with_role(
        &self,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<Vec<StringUuid>>;
}

const ROLE_COLUMNS: &str =
    "r.id, r.tenant_id, r.name, r.description, r.permissions, r.is_system, r.created_at, r.updated_at";

#[derive(FromRow)]
struct AssignedRoleRow {
    assignment_tenant_id: StringUuid,
    #[sqlx(flatten)]
    role: Role,
}

pub struct RbacRepositoryImpl {
    pool: MySqlPool,
}

impl RbacRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn permissions_json(permissions: &[crate::domain::RolePermission]) -> Result<String> {
        serde_json::to_string(permissions).map_err(|e| AppError::Internal(e.into()))
    }
}

#[async_trait]
impl RbacRepository for RbacRepositoryImpl {
    async fn create_role(&self, input: &CreateRoleInput) -> Result<Role> {
        let id = StringUuid::new_v4();
        let permissions = Self::permissions_json(&input.permissions)?;

        sqlx::query(
            r#"
            INSERT INTO roles (id, tenant_id, name, description, permissions, is_system, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&permissions)
        .bind(input.is_system)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("Role '{}' already exists in this tenant", input.name)
            })
        })?;

        self.find_role_by_id(id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to create role")))
    }

    async fn find_role_by_id(&self, id: StringUuid) -> Result<Option<Role>> {
        let sql = format!("SELECT {} FROM roles r WHERE r.id = ?", ROLE_COLUMNS);
        let role = sqlx::query_as::<_, Role>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(role)
    }

    async fn find_role_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Option<Role>> {
        let sql = format!(
            "SELECT {} FROM roles r WHERE r.tenant_id = ? AND r.name = ?",
            ROLE_COLUMNS
        );
        let role = sqlx::query_as::<_, Role>(&sql)
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(role)
    }

    async fn find_roles_by_tenant(&self, tenant_id: StringUuid) -> Result<Vec<Role>> {
        let sql = format!(
            "SELECT {} FROM roles r WHERE r.tenant_id = ? ORDER BY r.name",
            ROLE_COLUMNS
        );
        let roles = sqlx::query_as::<_, Role>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(roles)
    }

    async fn find_all_roles(&self) -> Result<Vec<Role>> {
        // Roles of deleted tenants are not reference data
        let sql = format!(
            "SELECT {} FROM roles r INNER JOIN tenants t ON t.id = r.tenant_id ORDER BY r.tenant_id, r.name",
            ROLE_COLUMNS
        );
        let roles = sqlx::query_as::<_, Role>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(roles)
    }

    async fn update_role(&self, id: StringUuid, input: &UpdateRoleInput) -> Result<Role> {
        let existing = self
            .find_role_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Role, id))?;

        let name = input.name.as_ref().unwrap_or(&existing.name);
        let description = input.description.as_ref().or(existing.description.as_ref());
        let permissions = Self::permissions_json(
            input
                .permissions
                .as_deref()
                .unwrap_or(&existing.permissions),
        )?;

        sqlx::query(
            r#"
            UPDATE roles
            SET name = ?, description = ?, permissions = ?, updated_at = NOW()
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(&permissions)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || format!("Role '{}' already exists in this tenant", name))
        })?;

        self.find_role_by_id(id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to update role")))
    }

    async fn delete_role(&self, id: StringUuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM user_tenant_roles WHERE role_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM roles WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(Entity::Role, id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<UserTenantRole> {
        sqlx::query(
            r#"
            INSERT INTO user_tenant_roles (user_id, tenant_id, role_id, created_at)
            VALUES (?, ?, ?, NOW(6))
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .bind(role_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "User {} already holds role {} in tenant {}",
                    user_id, role_id, tenant_id
                )
            })
        })?;

        self.find_assignment(user_id, tenant_id, role_id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to create assignment")))
    }

    async fn delete_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM user_tenant_roles WHERE user_id = ? AND tenant_id = ? AND role_id = ?",
        )
        .bind(user_id)
        .bind(tenant_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<Option<UserTenantRole>> {
        let assignment = sqlx::query_as::<_, UserTenantRole>(
            r#"
            SELECT user_id, tenant_id, role_id, created_at
            FROM user_tenant_roles
            WHERE user_id = ? AND tenant_id = ? AND role_id = ?
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(assignment)
    }

    async fn find_user_roles_in_tenant(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<Vec<Role>> {
        // The role's own tenant_id is returned as stored so callers can
        // re-verify it against the assignment's tenant.
        let sql = format!(
            "SELECT {} FROM user_tenant_roles utr \
             INNER JOIN roles r ON r.id = utr.role_id \
             INNER JOIN tenants t ON t.id = utr.tenant_id \
             WHERE utr.user_id = ? AND utr.tenant_id = ? \
             ORDER BY utr.created_at, r.name",
            ROLE_COLUMNS
        );
        let roles = sqlx::query_as::<_, Role>(&sql)
            .bind(user_id)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(roles)
    }

    async fn find_user_roles_across_tenants(
        &self,
        user_id: StringUuid,
    ) -> Result<Vec<(StringUuid, Role)>> {
        let sql = format!(
            "SELECT utr.tenant_id AS assignment_tenant_id, {} FROM user_tenant_roles utr \
             INNER JOIN roles r ON r.id = utr.role_id \
             INNER JOIN tenants t ON t.id = utr.tenant_id \
             WHERE utr.user_id = ? \
             ORDER BY t.name, utr.created_at, r.name",
            ROLE_COLUMNS
        );
        let rows = sqlx::query_as::<_, AssignedRoleRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.assignment_tenant_id, row.role))
            .collect())
    }

    async fn find_users_with_role(
        &self,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<Vec<StringUuid>> {
        let rows: Vec<(StringUuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM user_tenant_roles
            WHERE tenant_id = ? AND role_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
