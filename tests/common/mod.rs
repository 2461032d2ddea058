//! In-memory test infrastructure
//!
//! Repository and cache implementations backed by `tokio::sync::RwLock`, so
//! services can be exercised end to end without MySQL or Redis.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenant_authz::cache::{CacheOperations, FillToken};
use tenant_authz::config::EvaluatorMode;
use tenant_authz::domain::{
    CreatePolicyInput, CreateRoleInput, CreateTenantInput, CreateUserInput, EvaluationInput,
    Policy, Role, RolePermission, StringUuid, Tenant, UpdatePolicyInput, UpdateRoleInput, User,
    UserTenantRole,
};
use tenant_authz::error::{AppError, Entity, Result};
use tenant_authz::policy::{
    EmbeddedEvaluator, PolicyBundle, PolicyEvaluator, SnapshotInfo,
};
use tenant_authz::repository::{
    PolicyRepository, RbacRepository, TenantRepository, UserRepository,
};
use tenant_authz::service::{
    AccessService, AssignmentLedger, PolicyLoader, PolicyStore, RoleCatalog, TenantService,
};
use tokio::sync::RwLock;

pub const RBAC_REGO: &str = include_str!("../../policies/rbac.rego");

pub fn policy_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("policies")
}

// ============================================================================
// Tenants
// ============================================================================

#[derive(Default)]
pub struct TestTenantRepository {
    tenants: RwLock<Vec<Tenant>>,
}

impl TestTenantRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantRepository for TestTenantRepository {
    async fn create(&self, input: &CreateTenantInput) -> Result<Tenant> {
        let mut tenants = self.tenants.write().await;
        if tenants.iter().any(|t| t.name == input.name) {
            return Err(AppError::Conflict(format!(
                "Tenant '{}' already exists",
                input.name
            )));
        }
        let tenant = Tenant {
            name: input.name.clone(),
            ..Default::default()
        };
        tenants.push(tenant.clone());
        Ok(tenant)
    }

    async fn find_by_id(&self, id: StringUuid) -> Result<Option<Tenant>> {
        let tenants = self.tenants.read().await;
        Ok(tenants.iter().find(|t| t.id == id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Tenant>> {
        let tenants = self.tenants.read().await;
        Ok(tenants.iter().find(|t| t.name == name).cloned())
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<Vec<Tenant>> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: StringUuid) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let before = tenants.len();
        tenants.retain(|t| t.id != id);
        if tenants.len() == before {
            return Err(AppError::not_found(Entity::Tenant, id));
        }
        Ok(())
    }
}

// ============================================================================
// Users
// ============================================================================

#[derive(Default)]
pub struct TestUserRepository {
    users: RwLock<Vec<User>>,
}

impl TestUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for TestUserRepository {
    async fn create(&self, input: &CreateUserInput) -> Result<User> {
        let email = input.normalized_email();
        let mut users = self.users.write().await;
        if users.iter().any(|u| u.email == email) {
            return Err(AppError::Conflict(format!("User '{}' already exists", email)));
        }
        let user = User {
            email,
            display_name: input.display_name.clone(),
            ..Default::default()
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: StringUuid) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.email == email).cloned())
    }
}

// ============================================================================
// Roles and assignments
// ============================================================================

#[derive(Default)]
pub struct TestRbacRepository {
    roles: RwLock<Vec<Role>>,
    assignments: RwLock<Vec<UserTenantRole>>,
}

impl TestRbacRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an assignment without any ownership check, as a bad import would
    pub async fn insert_assignment_unchecked(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) {
        self.assignments.write().await.push(UserTenantRole {
            user_id,
            tenant_id,
            role_id,
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl RbacRepository for TestRbacRepository {
    async fn create_role(&self, input: &CreateRoleInput) -> Result<Role> {
        let mut roles = self.roles.write().await;
        if roles
            .iter()
            .any(|r| r.tenant_id == input.tenant_id && r.name == input.name)
        {
            return Err(AppError::Conflict(format!(
                "Role '{}' already exists in this tenant",
                input.name
            )));
        }
        let role = Role {
            tenant_id: input.tenant_id,
            name: input.name.clone(),
            description: input.description.clone(),
            permissions: input.permissions.clone(),
            is_system: input.is_system,
            ..Default::default()
        };
        roles.push(role.clone());
        Ok(role)
    }

    async fn find_role_by_id(&self, id: StringUuid) -> Result<Option<Role>> {
        let roles = self.roles.read().await;
        Ok(roles.iter().find(|r| r.id == id).cloned())
    }

    async fn find_role_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Option<Role>> {
        let roles = self.roles.read().await;
        Ok(roles
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.name == name)
            .cloned())
    }

    async fn find_roles_by_tenant(&self, tenant_id: StringUuid) -> Result<Vec<Role>> {
        let roles = self.roles.read().await;
        Ok(roles
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_all_roles(&self) -> Result<Vec<Role>> {
        Ok(self.roles.read().await.clone())
    }

    async fn update_role(&self, id: StringUuid, input: &UpdateRoleInput) -> Result<Role> {
        let mut roles = self.roles.write().await;
        let role = roles
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AppError::not_found(Entity::Role, id))?;
        if let Some(name) = &input.name {
            role.name = name.clone();
        }
        if let Some(description) = &input.description {
            role.description = Some(description.clone());
        }
        if let Some(permissions) = &input.permissions {
            role.permissions = permissions.clone();
        }
        role.updated_at = Utc::now();
        Ok(role.clone())
    }

    async fn delete_role(&self, id: StringUuid) -> Result<()> {
        let mut roles = self.roles.write().await;
        let before = roles.len();
        roles.retain(|r| r.id != id);
        if roles.len() == before {
            return Err(AppError::not_found(Entity::Role, id));
        }
        self.assignments.write().await.retain(|a| a.role_id != id);
        Ok(())
    }

    async fn create_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<UserTenantRole> {
        let mut assignments = self.assignments.write().await;
        if assignments
            .iter()
            .any(|a| a.user_id == user_id && a.tenant_id == tenant_id && a.role_id == role_id)
        {
            return Err(AppError::Conflict(
                "Role is already assigned to this user in this tenant".to_string(),
            ));
        }
        let assignment = UserTenantRole {
            user_id,
            tenant_id,
            role_id,
            created_at: Utc::now(),
        };
        assignments.push(assignment.clone());
        Ok(assignment)
    }

    async fn delete_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<bool> {
        let mut assignments = self.assignments.write().await;
        let before = assignments.len();
        assignments
            .retain(|a| !(a.user_id == user_id && a.tenant_id == tenant_id && a.role_id == role_id));
        Ok(assignments.len() != before)
    }

    async fn find_assignment(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<Option<UserTenantRole>> {
        let assignments = self.assignments.read().await;
        Ok(assignments
            .iter()
            .find(|a| a.user_id == user_id && a.tenant_id == tenant_id && a.role_id == role_id)
            .cloned())
    }

    async fn find_user_roles_in_tenant(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<Vec<Role>> {
        let assignments = self.assignments.read().await;
        let roles = self.roles.read().await;
        Ok(assignments
            .iter()
            .filter(|a| a.user_id == user_id && a.tenant_id == tenant_id)
            .filter_map(|a| roles.iter().find(|r| r.id == a.role_id).cloned())
            .collect())
    }

    async fn find_user_roles_across_tenants(
        &self,
        user_id: StringUuid,
    ) -> Result<Vec<(StringUuid, Role)>> {
        let assignments = self.assignments.read().await;
        let roles = self.roles.read().await;
        Ok(assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .filter_map(|a| {
                roles
                    .iter()
                    .find(|r| r.id == a.role_id)
                    .map(|r| (a.tenant_id, r.clone()))
            })
            .collect())
    }

    async fn find_users_with_role(
        &self,
        tenant_id: StringUuid,
        role_id: StringUuid,
    ) -> Result<Vec<StringUuid>> {
        let assignments = self.assignments.read().await;
        Ok(assignments
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.role_id == role_id)
            .map(|a| a.user_id)
            .collect())
    }
}

// ============================================================================
// Policies
// ============================================================================

#[derive(Default)]
pub struct TestPolicyRepository {
    policies: RwLock<Vec<Policy>>,
}

impl TestPolicyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyRepository for TestPolicyRepository {
    async fn create(&self, input: &CreatePolicyInput) -> Result<Policy> {
        let mut policies = self.policies.write().await;
        if policies
            .iter()
            .any(|p| p.tenant_id == input.tenant_id && p.name == input.name)
        {
            return Err(AppError::Conflict(format!(
                "Policy '{}' already exists in this tenant",
                input.name
            )));
        }
        let policy = Policy {
            tenant_id: input.tenant_id,
            name: input.name.clone(),
            description: input.description.clone(),
            source: input.source.clone(),
            ..Default::default()
        };
        policies.push(policy.clone());
        Ok(policy)
    }

    async fn find_by_id(&self, id: StringUuid) -> Result<Option<Policy>> {
        let policies = self.policies.read().await;
        Ok(policies.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_name(&self, tenant_id: StringUuid, name: &str) -> Result<Option<Policy>> {
        let policies = self.policies.read().await;
        Ok(policies
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.name == name)
            .cloned())
    }

    async fn list_by_tenant(&self, tenant_id: StringUuid) -> Result<Vec<Policy>> {
        let policies = self.policies.read().await;
        Ok(policies
            .iter()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<Policy>> {
        let policies = self.policies.read().await;
        Ok(policies.iter().filter(|p| p.is_active).cloned().collect())
    }

    async fn update(&self, id: StringUuid, input: &UpdatePolicyInput) -> Result<Policy> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::not_found(Entity::Policy, id))?;
        if let Some(name) = &input.name {
            policy.name = name.clone();
        }
        if let Some(description) = &input.description {
            policy.description = Some(description.clone());
        }
        if let Some(source) = &input.source {
            policy.source = source.clone();
        }
        policy.version += 1;
        policy.updated_at = Utc::now();
        Ok(policy.clone())
    }

    async fn set_active(&self, id: StringUuid, active: bool) -> Result<Policy> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::not_found(Entity::Policy, id))?;
        policy.is_active = active;
        Ok(policy.clone())
    }

    async fn delete(&self, id: StringUuid) -> Result<()> {
        let mut policies = self.policies.write().await;
        let before = policies.len();
        policies.retain(|p| p.id != id);
        if policies.len() == before {
            return Err(AppError::not_found(Entity::Policy, id));
        }
        Ok(())
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Role cache kept in a map, so invalidation paths are really exercised
#[derive(Default)]
pub struct MemoryCache {
    state: RwLock<MemoryCacheState>,
}

#[derive(Default)]
struct MemoryCacheState {
    entries: HashMap<(StringUuid, StringUuid), Vec<Role>>,
    generations: HashMap<(StringUuid, StringUuid), i64>,
    epoch: i64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

#[async_trait]
impl CacheOperations for MemoryCache {
    async fn get_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<Option<Vec<Role>>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .get(&(user_id, tenant_id))
            .cloned())
    }

    async fn user_roles_fill_token(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<FillToken> {
        let state = self.state.read().await;
        Ok(FillToken {
            epoch: state.epoch,
            generation: state
                .generations
                .get(&(user_id, tenant_id))
                .copied()
                .unwrap_or(0),
        })
    }

    async fn set_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        roles: &[Role],
        token: FillToken,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let generation = state
            .generations
            .get(&(user_id, tenant_id))
            .copied()
            .unwrap_or(0);
        if state.epoch != token.epoch || generation != token.generation {
            return Ok(false);
        }
        state.entries.insert((user_id, tenant_id), roles.to_vec());
        Ok(true)
    }

    async fn invalidate_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: Option<StringUuid>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        match tenant_id {
            Some(tenant_id) => {
                *state.generations.entry((user_id, tenant_id)).or_insert(0) += 1;
                state.entries.remove(&(user_id, tenant_id));
            }
            None => {
                state.epoch += 1;
                state.entries.retain(|(user, _), _| *user != user_id);
            }
        }
        Ok(())
    }

    async fn invalidate_all_user_roles(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.epoch += 1;
        state.entries.clear();
        Ok(())
    }
}

/// Wraps a cache and holds every fill back for `delay` before it is applied
pub struct SlowFillCache<C: CacheOperations> {
    inner: Arc<C>,
    delay: Duration,
}

impl<C: CacheOperations> SlowFillCache<C> {
    pub fn new(inner: Arc<C>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<C: CacheOperations> CacheOperations for SlowFillCache<C> {
    async fn get_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<Option<Vec<Role>>> {
        self.inner.get_user_roles(user_id, tenant_id).await
    }

    async fn user_roles_fill_token(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
    ) -> Result<FillToken> {
        self.inner.user_roles_fill_token(user_id, tenant_id).await
    }

    async fn set_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        roles: &[Role],
        token: FillToken,
    ) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .set_user_roles(user_id, tenant_id, roles, token)
            .await
    }

    async fn invalidate_user_roles(
        &self,
        user_id: StringUuid,
        tenant_id: Option<StringUuid>,
    ) -> Result<()> {
        self.inner.invalidate_user_roles(user_id, tenant_id).await
    }

    async fn invalidate_all_user_roles(&self) -> Result<()> {
        self.inner.invalidate_all_user_roles().await
    }
}

// ============================================================================
// Evaluator wrapper
// ============================================================================

/// Embedded evaluator with injectable latency and per-role failures
pub struct ScriptedEvaluator {
    inner: EmbeddedEvaluator,
    delay: Option<Duration>,
    failing_roles: HashSet<String>,
    pub calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self {
            inner: EmbeddedEvaluator::new(),
            delay: None,
            failing_roles: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_for(mut self, role: &str) -> Self {
        self.failing_roles.insert(role.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyEvaluator for ScriptedEvaluator {
    fn mode(&self) -> EvaluatorMode {
        self.inner.mode()
    }

    async fn load(&self, bundle: PolicyBundle) -> Result<SnapshotInfo> {
        self.inner.load(bundle).await
    }

    async fn evaluate(&self, policy_name: &str, input: &EvaluationInput) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_roles.contains(&input.role) {
            return Err(AppError::Evaluation(format!(
                "engine failure for role {}",
                input.role
            )));
        }
        self.inner.evaluate(policy_name, input).await
    }

    fn validate(&self, source: &str) -> Result<()> {
        self.inner.validate(source)
    }

    async fn snapshot_info(&self) -> Option<SnapshotInfo> {
        self.inner.snapshot_info().await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub type Ledger = AssignmentLedger<TestRbacRepository, TestTenantRepository, TestUserRepository>;
pub type Access<E> =
    AccessService<TestRbacRepository, TestTenantRepository, TestUserRepository, E>;

/// Every service wired over the in-memory repositories
pub struct Harness<E: PolicyEvaluator + 'static> {
    pub tenant_repo: Arc<TestTenantRepository>,
    pub user_repo: Arc<TestUserRepository>,
    pub rbac_repo: Arc<TestRbacRepository>,
    pub policy_repo: Arc<TestPolicyRepository>,
    pub cache: Arc<MemoryCache>,
    pub evaluator: Arc<E>,
    pub tenants: TenantService<TestTenantRepository, TestUserRepository>,
    pub roles: RoleCatalog<TestRbacRepository, TestTenantRepository>,
    pub ledger: Arc<Ledger>,
    pub policies: PolicyStore<TestPolicyRepository, TestTenantRepository, E>,
    pub loader: PolicyLoader<TestPolicyRepository, TestRbacRepository, E>,
    pub access: Access<E>,
}

impl<E: PolicyEvaluator + 'static> Harness<E> {
    pub fn new(evaluator: E, check_timeout: Duration) -> Self {
        let tenant_repo = Arc::new(TestTenantRepository::new());
        let user_repo = Arc::new(TestUserRepository::new());
        let rbac_repo = Arc::new(TestRbacRepository::new());
        let policy_repo = Arc::new(TestPolicyRepository::new());
        let cache = Arc::new(MemoryCache::new());
        let evaluator = Arc::new(evaluator);

        let tenants = TenantService::new(tenant_repo.clone(), user_repo.clone(), cache.clone());
        let roles = RoleCatalog::new(rbac_repo.clone(), tenant_repo.clone(), cache.clone());
        let ledger = Arc::new(AssignmentLedger::new(
            rbac_repo.clone(),
            tenant_repo.clone(),
            user_repo.clone(),
            cache.clone(),
        ));
        let policies = PolicyStore::new(policy_repo.clone(), tenant_repo.clone(), evaluator.clone());
        let loader = PolicyLoader::new(
            policy_repo.clone(),
            rbac_repo.clone(),
            evaluator.clone(),
            policy_dir(),
        );
        let access = AccessService::new(
            ledger.clone(),
            tenant_repo.clone(),
            user_repo.clone(),
            evaluator.clone(),
            check_timeout,
        );

        Self {
            tenant_repo,
            user_repo,
            rbac_repo,
            policy_repo,
            cache,
            evaluator,
            tenants,
            roles,
            ledger,
            policies,
            loader,
            access,
        }
    }

    pub async fn tenant(&self, name: &str) -> Tenant {
        self.tenants
            .create_tenant(CreateTenantInput {
                name: name.to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn user(&self, email: &str) -> User {
        self.tenants
            .create_user(CreateUserInput {
                email: email.to_string(),
                display_name: None,
            })
            .await
            .unwrap()
    }

    pub async fn role(&self, tenant_id: StringUuid, name: &str, grants: &[(&str, &[&str])]) -> Role {
        self.roles
            .create_role(CreateRoleInput {
                tenant_id,
                name: name.to_string(),
                description: None,
                permissions: grants
                    .iter()
                    .map(|(resource, actions)| RolePermission::new(*resource, actions.iter().copied()))
                    .collect(),
                is_system: false,
            })
            .await
            .unwrap()
    }

    pub async fn assign(&self, user: &User, tenant: &Tenant, role: &Role) {
        self.ledger.assign(user.id, tenant.id, role.id).await.unwrap();
    }

    /// Push the current catalog into the evaluator
    pub async fn load(&self) -> SnapshotInfo {
        self.loader.load().await.unwrap()
    }
}

/// Role names seen by the engine for a decision, in evaluation order
pub fn role_names(decision: &tenant_authz::domain::Decision) -> Vec<String> {
    decision
        .considered_roles
        .iter()
        .map(|v| v.role_name.clone())
        .collect()
}
