//! Policy evaluation
//!
//! One evaluator backend is chosen at startup: [`EmbeddedEvaluator`] runs Rego
//! modules in-process, [`RemoteEvaluator`] forwards every decision to an
//! OPA-compatible service. Both are driven through [`PolicyEvaluator`] and are
//! fed exclusively through [`PolicyBundle`]s, so they always hold the same
//! modules and reference data.
//!
//! A load builds a complete snapshot before swapping it in; evaluations in
//! flight keep using the snapshot they started with.

pub mod embedded;
pub mod remote;

pub use embedded::EmbeddedEvaluator;
pub use remote::RemoteEvaluator;

use crate::config::{EvaluatorConfig, EvaluatorMode};
use crate::domain::{EvaluationInput, Role, RolePermission, StringUuid};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Policy consulted by the access-check path
pub const RBAC_POLICY: &str = "rbac";

/// Name of the rule every policy module must define
pub const DECISION_RULE: &str = "allow";

/// Root of every tenant-authored package
pub const TENANT_PACKAGE_ROOT: &str = "tenants";

/// Top-level `data` documents holding reference data
const RESERVED_PACKAGE_ROOTS: &[&str] = &["roles"];

lazy_static::lazy_static! {
    static ref PACKAGE_REGEX: regex::Regex =
        regex::Regex::new(r"(?m)^\s*package\s+([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*$")
            .unwrap();
}

/// Extract the declared `package` of a Rego module
pub fn package_of(source: &str) -> Result<String> {
    PACKAGE_REGEX
        .captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| AppError::InvalidPolicy("missing package declaration".to_string()))
}

/// Parse and compile `source` with the policy engine without touching any
/// loaded state.
pub fn validate_source(source: &str) -> Result<()> {
    let package = package_of(source)?;
    let mut engine = regorus::Engine::new();
    engine
        .add_policy(format!("{}.rego", package), source.to_string())
        .map_err(|e| AppError::InvalidPolicy(e.to_string()))?;
    Ok(())
}

/// Package a tenant's own modules must be declared under, e.g.
/// `tenants.t_0f3c...`
pub fn tenant_package(tenant_id: StringUuid) -> String {
    format!("{}.t_{}", TENANT_PACKAGE_ROOT, tenant_id.simple())
}

/// Check that `package` sits in the namespace of its owner.
///
/// Tenant modules must live under [`tenant_package`]; built-ins may use any
/// package outside the tenant root and the reference data documents.
pub fn check_package_scope(tenant_id: Option<StringUuid>, package: &str) -> Result<()> {
    match tenant_id {
        Some(tenant_id) => {
            let prefix = tenant_package(tenant_id);
            let inside = package
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'));
            if inside {
                Ok(())
            } else {
                Err(AppError::InvalidPolicy(format!(
                    "package must be `{}` or nested under it",
                    prefix
                )))
            }
        }
        None => {
            let root = package.split('.').next().unwrap_or_default();
            if root == TENANT_PACKAGE_ROOT || RESERVED_PACKAGE_ROOTS.contains(&root) {
                Err(AppError::InvalidPolicy(format!(
                    "package root `{}` is reserved",
                    root
                )))
            } else {
                Ok(())
            }
        }
    }
}

/// One loadable policy module.
///
/// Built-in modules have no tenant; tenant-authored ones shadow a built-in of
/// the same name for that tenant only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyModule {
    pub tenant_id: Option<StringUuid>,
    pub name: String,
    pub version: i64,
    pub package: String,
    pub source: String,
}

impl PolicyModule {
    pub fn new(
        tenant_id: Option<StringUuid>,
        name: impl Into<String>,
        version: i64,
        source: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into();
        let package = package_of(&source)?;
        Ok(Self {
            tenant_id,
            name: name.into(),
            version,
            package,
            source,
        })
    }

    pub fn key(&self) -> ModuleKey {
        (self.tenant_id, self.name.clone())
    }

    /// Rule path queried for a decision, e.g. `data.rbac.allow`
    pub fn query(&self) -> String {
        format!("data.{}.{}", self.package, DECISION_RULE)
    }

    /// Identifier used when the module is uploaded to a remote service
    pub fn upload_id(&self) -> String {
        match self.tenant_id {
            Some(tenant_id) => format!("tenants/{}/{}", tenant_id, self.name),
            None => format!("builtin/{}", self.name),
        }
    }
}

pub type ModuleKey = (Option<StringUuid>, String);

/// Role/permission facts every policy evaluates against.
///
/// Shape: `{"roles": {tenant_id: {role_name: [{resource, actions}]}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceData {
    pub roles: BTreeMap<StringUuid, BTreeMap<String, Vec<RolePermission>>>,
}

impl ReferenceData {
    pub fn from_roles(roles: &[Role]) -> Self {
        let mut data = ReferenceData::default();
        for role in roles {
            data.roles
                .entry(role.tenant_id)
                .or_default()
                .insert(role.name.clone(), role.permissions.clone());
        }
        data
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| AppError::Internal(e.into()))
    }
}

/// Everything one load installs
#[derive(Debug, Clone, Default)]
pub struct PolicyBundle {
    pub modules: Vec<PolicyModule>,
    pub data: ReferenceData,
}

impl PolicyBundle {
    /// Assemble a bundle, dropping modules that would collide.
    ///
    /// Modules declared outside their owner's package namespace are skipped.
    /// A later module is skipped when its key or its package is already taken,
    /// so built-ins should come first.
    pub fn new(modules: Vec<PolicyModule>, data: ReferenceData) -> Self {
        let mut keys = HashSet::new();
        let mut packages = HashSet::new();
        let mut accepted = Vec::with_capacity(modules.len());

        for module in modules {
            if let Err(e) = check_package_scope(module.tenant_id, &module.package) {
                tracing::warn!(
                    tenant_id = ?module.tenant_id,
                    policy = %module.name,
                    package = %module.package,
                    error = %e,
                    "Skipping policy module outside its package namespace"
                );
                continue;
            }
            if keys.contains(&module.key()) || packages.contains(&module.package) {
                tracing::warn!(
                    tenant_id = ?module.tenant_id,
                    policy = %module.name,
                    package = %module.package,
                    "Skipping policy module that collides with an earlier one"
                );
                continue;
            }
            keys.insert(module.key());
            packages.insert(module.package.clone());
            accepted.push(module);
        }

        Self {
            modules: accepted,
            data,
        }
    }
}

/// Module metadata as recorded in a loaded snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedPolicy {
    pub tenant_id: Option<StringUuid>,
    pub name: String,
    pub version: i64,
    pub package: String,
}

/// What the evaluator currently has loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Increments on every successful load
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
    pub policies: Vec<LoadedPolicy>,
}

impl SnapshotInfo {
    pub fn version_of(&self, tenant_id: Option<StringUuid>, name: &str) -> Option<i64> {
        self.policies
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.name == name)
            .map(|p| p.version)
    }
}

/// Immutable loaded state shared by both backends
pub(crate) struct Snapshot<M> {
    pub(crate) info: SnapshotInfo,
    modules: HashMap<ModuleKey, M>,
}

impl<M> Snapshot<M> {
    pub(crate) fn new(
        previous: Option<&Snapshot<M>>,
        modules: Vec<(PolicyModule, M)>,
    ) -> Self {
        let generation = previous.map(|s| s.info.generation + 1).unwrap_or(1);
        let policies = modules
            .iter()
            .map(|(module, _)| LoadedPolicy {
                tenant_id: module.tenant_id,
                name: module.name.clone(),
                version: module.version,
                package: module.package.clone(),
            })
            .collect();
        let modules = modules
            .into_iter()
            .map(|(module, prepared)| (module.key(), prepared))
            .collect();

        Self {
            info: SnapshotInfo {
                generation,
                loaded_at: Utc::now(),
                policies,
            },
            modules,
        }
    }

    pub(crate) fn modules_iter(&self) -> impl Iterator<Item = &M> {
        self.modules.values()
    }

    /// The tenant's own module if it authored one under `name`, else the built-in
    pub(crate) fn lookup(&self, name: &str, tenant_id: StringUuid) -> Result<&M> {
        self.modules
            .get(&(Some(tenant_id), name.to_string()))
            .or_else(|| self.modules.get(&(None, name.to_string())))
            .ok_or_else(|| AppError::PolicyNotFound(name.to_string()))
    }
}

pub(crate) type SharedSnapshot<M> = tokio::sync::RwLock<Option<Arc<Snapshot<M>>>>;

/// Mode-agnostic evaluator contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    fn mode(&self) -> EvaluatorMode;

    /// Install `bundle` as the new snapshot, replacing the previous one atomically
    async fn load(&self, bundle: PolicyBundle) -> Result<SnapshotInfo>;

    /// Verdict of `policy_name` for `input`; `false` is a normal result
    async fn evaluate(&self, policy_name: &str, input: &EvaluationInput) -> Result<bool>;

    /// Check that `source` compiles; never touches loaded state
    fn validate(&self, source: &str) -> Result<()>;

    async fn snapshot_info(&self) -> Option<SnapshotInfo>;
}

/// The backend selected for this process
pub enum Evaluator {
    Embedded(EmbeddedEvaluator),
    Remote(RemoteEvaluator),
}

impl Evaluator {
    pub fn from_config(config: &EvaluatorConfig) -> Result<Self> {
        match config.mode {
            EvaluatorMode::Embedded => Ok(Evaluator::Embedded(EmbeddedEvaluator::new())),
            EvaluatorMode::Remote => Ok(Evaluator::Remote(RemoteEvaluator::new(&config.remote)?)),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for Evaluator {
    fn mode(&self) -> EvaluatorMode {
        match self {
            Evaluator::Embedded(e) => e.mode(),
            Evaluator::Remote(e) => e.mode(),
        }
    }

    async fn load(&self, bundle: PolicyBundle) -> Result<SnapshotInfo> {
        match self {
            Evaluator::Embedded(e) => e.load(bundle).await,
            Evaluator::Remote(e) => e.load(bundle).await,
        }
    }

    async fn evaluate(&self, policy_name: &str, input: &EvaluationInput) -> Result<bool> {
        match self {
            Evaluator::Embedded(e) => e.evaluate(policy_name, input).await,
            Evaluator::Remote(e) => e.evaluate(policy_name, input).await,
        }
    }

    fn validate(&self, source: &str) -> Result<()> {
        match self {
            Evaluator::Embedded(e) => e.validate(source),
            Evaluator::Remote(e) => e.validate(source),
        }
    }

    async fn snapshot_info(&self) -> Option<SnapshotInfo> {
        match self {
            Evaluator::Embedded(e) => e.snapshot_info().await,
            Evaluator::Remote(e) => e.snapshot_info().await,
        }
    }
}
