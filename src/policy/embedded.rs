//! In-process Rego evaluation

use super::{
    validate_source, PolicyBundle, PolicyEvaluator, PolicyModule, SharedSnapshot, Snapshot,
    SnapshotInfo,
};
use crate::config::EvaluatorMode;
use crate::domain::EvaluationInput;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use regorus::{Engine, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// A module compiled into its own engine with the reference data bound
struct PreparedModule {
    // Engine is Send but not guaranteed Sync
    engine: Mutex<Engine>,
    query: String,
}

impl PreparedModule {
    fn prepare(module: &PolicyModule, data: &Value) -> Result<Self> {
        let mut engine = Engine::new();
        engine
            .add_policy(format!("{}.rego", module.name), module.source.clone())
            .map_err(|e| AppError::InvalidPolicy(format!("{}: {}", module.name, e)))?;
        engine
            .add_data(data.clone())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to bind policy data: {}", e)))?;

        Ok(Self {
            engine: Mutex::new(engine),
            query: module.query(),
        })
    }

    fn evaluate(&self, input: Value) -> Result<bool> {
        // Engines are cheap to clone; each evaluation gets its own input slot
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| AppError::Evaluation(format!("{} engine is poisoned", self.query)))?
            .clone();
        engine.set_input(input);
        let result = engine
            .eval_rule(self.query.clone())
            .map_err(|e| AppError::Evaluation(e.to_string()))?;

        match result {
            Value::Bool(allowed) => Ok(allowed),
            Value::Undefined => Ok(false),
            other => Err(AppError::Evaluation(format!(
                "{} produced a non-boolean result: {:?}",
                self.query, other
            ))),
        }
    }
}

/// Evaluator that runs policies in this process
pub struct EmbeddedEvaluator {
    snapshot: SharedSnapshot<PreparedModule>,
}

impl EmbeddedEvaluator {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
        }
    }

    async fn current(&self) -> Option<Arc<Snapshot<PreparedModule>>> {
        self.snapshot.read().await.clone()
    }
}

impl Default for EmbeddedEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn to_engine_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    let json = serde_json::to_string(value).map_err(|e| AppError::Internal(e.into()))?;
    Value::from_json_str(&json).map_err(|e| AppError::Internal(anyhow::anyhow!("{}", e)))
}

#[async_trait]
impl PolicyEvaluator for EmbeddedEvaluator {
    fn mode(&self) -> EvaluatorMode {
        EvaluatorMode::Embedded
    }

    async fn load(&self, bundle: PolicyBundle) -> Result<SnapshotInfo> {
        let data = to_engine_value(&bundle.data)?;

        // Compile everything before taking the lock; a failure leaves the
        // previous snapshot in place.
        let mut prepared = Vec::with_capacity(bundle.modules.len());
        for module in bundle.modules {
            let compiled = PreparedModule::prepare(&module, &data)?;
            prepared.push((module, compiled));
        }

        let mut guard = self.snapshot.write().await;
        let snapshot = Arc::new(Snapshot::new(guard.as_deref(), prepared));
        let info = snapshot.info.clone();
        *guard = Some(snapshot);

        tracing::info!(
            generation = info.generation,
            modules = info.policies.len(),
            "Embedded policy snapshot loaded"
        );
        Ok(info)
    }

    async fn evaluate(&self, policy_name: &str, input: &EvaluationInput) -> Result<bool> {
        let snapshot = self
            .current()
            .await
            .ok_or_else(|| AppError::PolicyNotFound(policy_name.to_string()))?;
        let module = snapshot.lookup(policy_name, input.tenant_id)?;
        module.evaluate(to_engine_value(input)?)
    }

    fn validate(&self, source: &str) -> Result<()> {
        validate_source(source)
    }

    async fn snapshot_info(&self) -> Option<SnapshotInfo> {
        self.current().await.map(|s| s.info.clone())
    }
}
