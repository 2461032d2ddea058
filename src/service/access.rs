//! Access-check facade
//!
//! Resolves a user's roles in a tenant, evaluates the RBAC policy once per
//! role concurrently, and grants access when any role allows it.

use super::assignment::AssignmentLedger;
use crate::domain::{Decision, EvaluationInput, Role, RoleFailure, RoleVerdict, StringUuid};
use crate::error::{AppError, Entity, Result};
use crate::policy::{PolicyEvaluator, RBAC_POLICY};
use crate::repository::{RbacRepository, TenantRepository, UserRepository};
use crate::telemetry::metrics::{DECISIONS_TOTAL, DECISION_DURATION_SECONDS, ROLE_EVALUATIONS_TOTAL};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Caller-side cancellation for an in-flight access check
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Trigger for a [`CancelSignal`]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub struct AccessService<R, T, U, E>
where
    R: RbacRepository,
    T: TenantRepository,
    U: UserRepository,
    E: PolicyEvaluator,
{
    ledger: Arc<AssignmentLedger<R, T, U>>,
    tenant_repo: Arc<T>,
    user_repo: Arc<U>,
    evaluator: Arc<E>,
    check_timeout: Duration,
}

impl<R, T, U, E> AccessService<R, T, U, E>
where
    R: RbacRepository,
    T: TenantRepository,
    U: UserRepository,
    E: PolicyEvaluator,
{
    pub fn new(
        ledger: Arc<AssignmentLedger<R, T, U>>,
        tenant_repo: Arc<T>,
        user_repo: Arc<U>,
        evaluator: Arc<E>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            tenant_repo,
            user_repo,
            evaluator,
            check_timeout,
        }
    }

    /// May the user perform `action` on `resource` inside the tenant?
    ///
    /// Bounded by the configured check timeout; expiry yields `Cancelled`.
    pub async fn check(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        resource: &str,
        action: &str,
    ) -> Result<Decision> {
        self.check_with_cancel(user_id, tenant_id, resource, action, &CancelSignal::never())
            .await
    }

    /// [`check`](Self::check) that also stops when `cancel` fires.
    ///
    /// Dropping the decision future drops every pending role evaluation with it.
    pub async fn check_with_cancel(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        resource: &str,
        action: &str,
        cancel: &CancelSignal,
    ) -> Result<Decision> {
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(user_id = %user_id, tenant_id = %tenant_id, "Access check cancelled by caller");
                Err(AppError::Cancelled)
            }
            _ = tokio::time::sleep(self.check_timeout) => {
                warn!(
                    user_id = %user_id,
                    tenant_id = %tenant_id,
                    timeout_ms = self.check_timeout.as_millis() as u64,
                    "Access check timed out"
                );
                Err(AppError::Cancelled)
            }
            result = self.decide(user_id, tenant_id, resource, action) => result,
        };

        let outcome = match &result {
            Ok(decision) if decision.allowed => "allow",
            Ok(_) => "deny",
            Err(AppError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        metrics::counter!(DECISIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(DECISION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        result
    }

    async fn decide(
        &self,
        user_id: StringUuid,
        tenant_id: StringUuid,
        resource: &str,
        action: &str,
    ) -> Result<Decision> {
        if self.user_repo.find_by_id(user_id).await?.is_none() {
            return Err(AppError::not_found(Entity::User, user_id));
        }
        if self.tenant_repo.find_by_id(tenant_id).await?.is_none() {
            return Err(AppError::not_found(Entity::Tenant, tenant_id));
        }

        let roles = self.ledger.roles_for(user_id, tenant_id).await?;
        if roles.is_empty() {
            debug!(user_id = %user_id, tenant_id = %tenant_id, "No roles in tenant");
            return Ok(Decision::deny());
        }

        let candidates: Vec<Role> = roles
            .into_iter()
            .filter(|role| {
                if role.belongs_to(tenant_id) {
                    return true;
                }
                warn!(
                    user_id = %user_id,
                    tenant_id = %tenant_id,
                    role_id = %role.id,
                    role_tenant_id = %role.tenant_id,
                    "Ignoring assigned role owned by another tenant"
                );
                metrics::counter!(ROLE_EVALUATIONS_TOTAL, "result" => "excluded").increment(1);
                false
            })
            .collect();

        if candidates.is_empty() {
            return Ok(Decision::deny());
        }

        let evaluations = candidates.iter().map(|role| async move {
            let input = EvaluationInput::project(role, resource, action, tenant_id);
            let result = self.evaluator.evaluate(RBAC_POLICY, &input).await;
            (role, result)
        });
        let results = join_all(evaluations).await;

        let mut verdicts = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        let mut errors = Vec::new();

        for (role, result) in results {
            let allowed = match result {
                Ok(allowed) => {
                    let label = if allowed { "allow" } else { "deny" };
                    metrics::counter!(ROLE_EVALUATIONS_TOTAL, "result" => label).increment(1);
                    allowed
                }
                Err(e) => {
                    metrics::counter!(ROLE_EVALUATIONS_TOTAL, "result" => "error").increment(1);
                    warn!(
                        user_id = %user_id,
                        tenant_id = %tenant_id,
                        role_id = %role.id,
                        error = %e,
                        "Role evaluation failed, counting it as not allowing"
                    );
                    failures.push(RoleFailure {
                        role_id: role.id,
                        error: e.to_string(),
                    });
                    errors.push(e);
                    false
                }
            };
            verdicts.push(RoleVerdict {
                role_id: role.id,
                role_name: role.name.clone(),
                allowed,
            });
        }

        if failures.len() == verdicts.len() {
            error!(
                user_id = %user_id,
                tenant_id = %tenant_id,
                roles = verdicts.len(),
                "Every role evaluation failed"
            );
            let nothing_loaded = errors
                .iter()
                .all(|e| matches!(e, AppError::PolicyNotFound(_)));
            return Err(match errors.into_iter().next() {
                Some(AppError::PolicyNotFound(name)) if nothing_loaded => {
                    AppError::PolicyNotFound(name)
                }
                _ => AppError::Evaluation(format!(
                    "all {} role evaluations failed",
                    verdicts.len()
                )),
            });
        }

        let decision = Decision::aggregate(verdicts, failures);
        debug!(
            user_id = %user_id,
            tenant_id = %tenant_id,
            resource,
            action,
            allowed = decision.allowed,
            roles = decision.considered_roles.len(),
            "Access decision"
        );
        Ok(decision)
    }
}
