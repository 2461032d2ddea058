//! Policy loading: assembles bundles from storage and installs them in the evaluator

use crate::domain::StringUuid;
use crate::error::{AppError, Result};
use crate::policy::{PolicyBundle, PolicyEvaluator, PolicyModule, ReferenceData, SnapshotInfo};
use crate::repository::{PolicyRepository, RbacRepository};
use crate::telemetry::metrics::POLICY_LOADS_TOTAL;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Version reported for modules shipped in the policy directory
pub const BUILTIN_POLICY_VERSION: i64 = 1;

/// A stored policy whose loaded version differs from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDrift {
    pub tenant_id: StringUuid,
    pub name: String,
    /// `None` when the loaded module is no longer active in the store
    pub store_version: Option<i64>,
    /// `None` when the policy has never been loaded
    pub loaded_version: Option<i64>,
}

pub struct PolicyLoader<P: PolicyRepository, R: RbacRepository, E: PolicyEvaluator> {
    policy_repo: Arc<P>,
    rbac_repo: Arc<R>,
    evaluator: Arc<E>,
    policy_dir: PathBuf,
}

impl<P, R, E> PolicyLoader<P, R, E>
where
    P: PolicyRepository + 'static,
    R: RbacRepository + 'static,
    E: PolicyEvaluator + 'static,
{
    pub fn new(
        policy_repo: Arc<P>,
        rbac_repo: Arc<R>,
        evaluator: Arc<E>,
        policy_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            policy_repo,
            rbac_repo,
            evaluator,
            policy_dir: policy_dir.into(),
        }
    }

    /// Built-in `*.rego` modules, sorted by file name
    async fn builtin_modules(&self) -> Result<Vec<PolicyModule>> {
        let mut entries = tokio::fs::read_dir(&self.policy_dir).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to read policy directory {}: {}",
                self.policy_dir.display(),
                e
            ))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::Internal(e.into()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("rego") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut modules = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
            modules.push(PolicyModule::new(None, name, BUILTIN_POLICY_VERSION, source)?);
        }
        Ok(modules)
    }

    /// Everything the next load would install: built-ins, every tenant's
    /// active policies and the whole role catalog.
    pub async fn build_bundle(&self) -> Result<PolicyBundle> {
        let mut modules = self.builtin_modules().await?;

        for policy in self.policy_repo.list_active().await? {
            match PolicyModule::new(
                Some(policy.tenant_id),
                &policy.name,
                policy.version,
                &policy.source,
            ) {
                Ok(module) => modules.push(module),
                Err(e) => warn!(
                    policy_id = %policy.id,
                    name = %policy.name,
                    error = %e,
                    "Skipping stored policy without a usable package"
                ),
            }
        }

        let roles = self.rbac_repo.find_all_roles().await?;
        Ok(PolicyBundle::new(modules, ReferenceData::from_roles(&roles)))
    }

    /// Rebuild the bundle and install it.
    ///
    /// This is the only path that writes to the evaluator, so both backends
    /// always see the same modules and data.
    pub async fn load(&self) -> Result<SnapshotInfo> {
        let mode = self.evaluator.mode().to_string();
        let result = match self.build_bundle().await {
            Ok(bundle) => self.evaluator.load(bundle).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(info) => {
                metrics::counter!(POLICY_LOADS_TOTAL, "mode" => mode, "result" => "success")
                    .increment(1);
                info!(
                    generation = info.generation,
                    policies = info.policies.len(),
                    "Policies loaded"
                );
            }
            Err(e) => {
                metrics::counter!(POLICY_LOADS_TOTAL, "mode" => mode, "result" => "error")
                    .increment(1);
                error!(error = %e, "Policy load failed");
            }
        }
        result
    }

    /// Stored policies whose version differs from what is loaded.
    ///
    /// Drift is an expected gap between authoring and loading; it is logged
    /// and reported, never raised.
    pub async fn drift(&self) -> Result<Vec<PolicyDrift>> {
        let active = self.policy_repo.list_active().await?;
        let snapshot = self.evaluator.snapshot_info().await;

        let mut drift = Vec::new();
        let mut seen = HashSet::new();
        for policy in &active {
            seen.insert((policy.tenant_id, policy.name.clone()));
            let loaded_version = snapshot
                .as_ref()
                .and_then(|s| s.version_of(Some(policy.tenant_id), &policy.name));
            if loaded_version != Some(policy.version) {
                drift.push(PolicyDrift {
                    tenant_id: policy.tenant_id,
                    name: policy.name.clone(),
                    store_version: Some(policy.version),
                    loaded_version,
                });
            }
        }

        if let Some(snapshot) = &snapshot {
            for loaded in &snapshot.policies {
                let Some(tenant_id) = loaded.tenant_id else {
                    continue;
                };
                if !seen.contains(&(tenant_id, loaded.name.clone())) {
                    drift.push(PolicyDrift {
                        tenant_id,
                        name: loaded.name.clone(),
                        store_version: None,
                        loaded_version: Some(loaded.version),
                    });
                }
            }
        }

        for d in &drift {
            warn!(
                tenant_id = %d.tenant_id,
                policy = %d.name,
                store_version = ?d.store_version,
                loaded_version = ?d.loaded_version,
                "Loaded policy differs from the policy store"
            );
        }
        Ok(drift)
    }

    /// Reload every `interval` until `shutdown` turns true or its sender is dropped
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; startup already loaded.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.load().await {
                            warn!(error = %e, "Periodic policy refresh failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Policy refresh stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluatorMode;
    use crate::domain::{Policy, Role, RolePermission};
    use crate::policy::{tenant_package, LoadedPolicy, MockPolicyEvaluator};
    use crate::repository::policy::MockPolicyRepository;
    use crate::repository::rbac::MockRbacRepository;
    use chrono::Utc;

    const RBAC_REGO: &str = include_str!("../../policies/rbac.rego");

    fn policy_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rbac.rego"), RBAC_REGO).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a policy").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_build_bundle_collects_builtins_policies_and_roles() {
        let dir = policy_dir();
        let tenant_id = StringUuid::new_v4();

        let mut policy_repo = MockPolicyRepository::new();
        policy_repo.expect_list_active().returning(move || {
            Ok(vec![Policy {
                tenant_id,
                name: "content".to_string(),
                source: format!(
                    "package {}.content\n\ndefault allow := false\n",
                    tenant_package(tenant_id)
                ),
                version: 3,
                ..Default::default()
            }])
        });
        let mut rbac_repo = MockRbacRepository::new();
        rbac_repo.expect_find_all_roles().returning(move || {
            Ok(vec![Role {
                tenant_id,
                name: "viewer".to_string(),
                permissions: vec![RolePermission::new("settings", ["read"])],
                ..Default::default()
            }])
        });

        let loader = PolicyLoader::new(
            Arc::new(policy_repo),
            Arc::new(rbac_repo),
            Arc::new(MockPolicyEvaluator::new()),
            dir.path(),
        );
        let bundle = loader.build_bundle().await.unwrap();

        let modules: Vec<_> = bundle
            .modules
            .iter()
            .map(|m| (m.tenant_id, m.name.as_str(), m.version))
            .collect();
        assert_eq!(
            modules,
            vec![(None, "rbac", 1), (Some(tenant_id), "content", 3)]
        );
        assert!(bundle.data.roles[&tenant_id].contains_key("viewer"));
    }

    #[tokio::test]
    async fn test_missing_policy_dir_fails_load() {
        let mut evaluator = MockPolicyEvaluator::new();
        evaluator.expect_mode().return_const(EvaluatorMode::Embedded);
        evaluator.expect_load().never();

        let loader = PolicyLoader::new(
            Arc::new(MockPolicyRepository::new()),
            Arc::new(MockRbacRepository::new()),
            Arc::new(evaluator),
            "/nonexistent/policies",
        );
        assert!(loader.load().await.is_err());
    }

    #[tokio::test]
    async fn test_drift_reports_unloaded_versions() {
        let tenant_id = StringUuid::new_v4();

        let mut policy_repo = MockPolicyRepository::new();
        policy_repo.expect_list_active().returning(move || {
            Ok(vec![
                Policy {
                    tenant_id,
                    name: "content".to_string(),
                    version: 2,
                    ..Default::default()
                },
                Policy {
                    tenant_id,
                    name: "billing".to_string(),
                    version: 1,
                    ..Default::default()
                },
            ])
        });

        let mut evaluator = MockPolicyEvaluator::new();
        evaluator.expect_snapshot_info().returning(move || {
            Some(SnapshotInfo {
                generation: 4,
                loaded_at: Utc::now(),
                policies: vec![
                    LoadedPolicy {
                        tenant_id: None,
                        name: "rbac".to_string(),
                        version: 1,
                        package: "rbac".to_string(),
                    },
                    LoadedPolicy {
                        tenant_id: Some(tenant_id),
                        name: "content".to_string(),
                        version: 1,
                        package: "tenants.acme.content".to_string(),
                    },
                    LoadedPolicy {
                        tenant_id: Some(tenant_id),
                        name: "billing".to_string(),
                        version: 1,
                        package: "tenants.acme.billing".to_string(),
                    },
                ],
            })
        });

        let loader = PolicyLoader::new(
            Arc::new(policy_repo),
            Arc::new(MockRbacRepository::new()),
            Arc::new(evaluator),
            "./policies",
        );
        let drift = loader.drift().await.unwrap();
        assert_eq!(
            drift,
            vec![PolicyDrift {
                tenant_id,
                name: "content".to_string(),
                store_version: Some(2),
                loaded_version: Some(1),
            }]
        );
    }

    #[tokio::test]
    async fn test_drift_before_first_load() {
        let tenant_id = StringUuid::new_v4();
        let mut policy_repo = MockPolicyRepository::new();
        policy_repo.expect_list_active().returning(move || {
            Ok(vec![Policy {
                tenant_id,
                name: "content".to_string(),
                ..Default::default()
            }])
        });
        let mut evaluator = MockPolicyEvaluator::new();
        evaluator.expect_snapshot_info().returning(|| None);

        let loader = PolicyLoader::new(
            Arc::new(policy_repo),
            Arc::new(MockRbacRepository::new()),
            Arc::new(evaluator),
            "./policies",
        );
        let drift = loader.drift().await.unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].loaded_version, None);
    }

    #[tokio::test]
    async fn test_refresh_stops_on_shutdown() {
        let mut evaluator = MockPolicyEvaluator::new();
        evaluator.expect_mode().return_const(EvaluatorMode::Embedded);

        let loader = Arc::new(PolicyLoader::new(
            Arc::new(MockPolicyRepository::new()),
            Arc::new(MockRbacRepository::new()),
            Arc::new(evaluator),
            "/nonexistent/policies",
        ));
        let (tx, rx) = watch::channel(false);
        let handle = loader.spawn_refresh(Duration::from_secs(3600), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresh task did not stop")
            .unwrap();
    }
}
