//! OPA-compatible remote evaluation over HTTP
//!
//! Protocol, relative to the configured base URL (which carries the `/v1`
//! prefix):
//!
//! - `PUT  /policies/{id}`             Rego source, `text/plain`; `id` keeps its `/`
//! - `PUT  /data`                      reference data document
//! - `POST /data/{package path}/allow` `{"input": …}` -> `{"result": bool}`

use super::{
    validate_source, PolicyBundle, PolicyEvaluator, SharedSnapshot, Snapshot, SnapshotInfo,
    DECISION_RULE,
};
use crate::config::{EvaluatorMode, RemoteEvaluatorConfig};
use crate::domain::EvaluationInput;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Where a loaded module lives on the remote service
struct RemoteModule {
    upload_id: String,
    decision_path: String,
}

#[derive(Serialize)]
struct DecisionRequest<'a> {
    input: &'a EvaluationInput,
}

#[derive(Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

/// Evaluator backed by a remote policy service
pub struct RemoteEvaluator {
    http_client: Client,
    base_url: String,
    token: Option<String>,
    decision_timeout: Duration,
    load_timeout: Duration,
    snapshot: SharedSnapshot<RemoteModule>,
}

impl RemoteEvaluator {
    pub fn new(config: &RemoteEvaluatorConfig) -> Result<Self> {
        let http_client = Client::builder()
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            decision_timeout: config.timeout,
            load_timeout: config.load_timeout,
            snapshot: RwLock::new(None),
        })
    }

    async fn current(&self) -> Option<Arc<Snapshot<RemoteModule>>> {
        self.snapshot.read().await.clone()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn policy_url(&self, upload_id: &str) -> String {
        let path: Vec<_> = upload_id.split('/').map(urlencoding::encode).collect();
        format!("{}/policies/{}", self.base_url, path.join("/"))
    }

    async fn put_policy(&self, upload_id: &str, source: &str) -> Result<()> {
        let response = self
            .authorized(self.http_client.put(self.policy_url(upload_id)))
            .timeout(self.load_timeout)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(source.to_string())
            .send()
            .await
            .map_err(|e| AppError::Evaluation(format!("Failed to upload policy {}: {}", upload_id, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Evaluation(format!(
                "Failed to upload policy {}: {} - {}",
                upload_id, status, body
            )));
        }
        Ok(())
    }

    async fn delete_policy(&self, upload_id: &str) -> Result<()> {
        let response = self
            .authorized(self.http_client.delete(self.policy_url(upload_id)))
            .timeout(self.load_timeout)
            .send()
            .await
            .map_err(|e| AppError::Evaluation(format!("Failed to delete policy {}: {}", upload_id, e)))?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::Evaluation(format!(
                "Failed to delete policy {}: {}",
                upload_id, status
            )));
        }
        Ok(())
    }

    async fn put_data(&self, bundle: &PolicyBundle) -> Result<()> {
        let url = format!("{}/data", self.base_url);
        let response = self
            .authorized(self.http_client.put(&url))
            .timeout(self.load_timeout)
            .json(&bundle.data)
            .send()
            .await
            .map_err(|e| AppError::Evaluation(format!("Failed to upload policy data: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Evaluation(format!(
                "Failed to upload policy data: {} - {}",
                status, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyEvaluator for RemoteEvaluator {
    fn mode(&self) -> EvaluatorMode {
        EvaluatorMode::Remote
    }

    async fn load(&self, bundle: PolicyBundle) -> Result<SnapshotInfo> {
        for module in &bundle.modules {
            self.put_policy(&module.upload_id(), &module.source).await?;
        }
        self.put_data(&bundle).await?;

        let modules: Vec<_> = bundle
            .modules
            .into_iter()
            .map(|module| {
                let remote = RemoteModule {
                    upload_id: module.upload_id(),
                    decision_path: format!(
                        "data/{}/{}",
                        module.package.replace('.', "/"),
                        DECISION_RULE
                    ),
                };
                (module, remote)
            })
            .collect();

        let (info, stale) = {
            let mut guard = self.snapshot.write().await;
            let keep: HashSet<&str> = modules.iter().map(|(_, m)| m.upload_id.as_str()).collect();
            let stale: Vec<String> = guard
                .as_ref()
                .map(|previous| {
                    previous
                        .modules_iter()
                        .filter(|m| !keep.contains(m.upload_id.as_str()))
                        .map(|m| m.upload_id.clone())
                        .collect()
                })
                .unwrap_or_default();

            let snapshot = Arc::new(Snapshot::new(guard.as_deref(), modules));
            let info = snapshot.info.clone();
            *guard = Some(snapshot);
            (info, stale)
        };

        for upload_id in stale {
            if let Err(e) = self.delete_policy(&upload_id).await {
                tracing::warn!(policy = %upload_id, error = %e, "Failed to remove stale remote policy");
            }
        }

        tracing::info!(
            generation = info.generation,
            modules = info.policies.len(),
            "Remote policy snapshot loaded"
        );
        Ok(info)
    }

    async fn evaluate(&self, policy_name: &str, input: &EvaluationInput) -> Result<bool> {
        let snapshot = self
            .current()
            .await
            .ok_or_else(|| AppError::PolicyNotFound(policy_name.to_string()))?;
        let module = snapshot.lookup(policy_name, input.tenant_id)?;

        let url = format!("{}/{}", self.base_url, module.decision_path);
        let response = self
            .authorized(self.http_client.post(&url))
            .timeout(self.decision_timeout)
            .json(&DecisionRequest { input })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Evaluation(format!("Remote evaluation of {} timed out", policy_name))
                } else {
                    AppError::Evaluation(format!("Remote evaluation of {} failed: {}", policy_name, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(AppError::Evaluation(format!(
                "Remote evaluation of {} returned {}",
                policy_name,
                response.status()
            )));
        }

        let body: DecisionResponse = response.json().await.map_err(|e| {
            AppError::Evaluation(format!("Malformed remote evaluation response: {}", e))
        })?;

        match body.result {
            // Undefined decision
            None | Some(serde_json::Value::Null) => Ok(false),
            Some(serde_json::Value::Bool(allowed)) => Ok(allowed),
            Some(other) => Err(AppError::Evaluation(format!(
                "Remote evaluation of {} produced a non-boolean result: {}",
                policy_name, other
            ))),
        }
    }

    fn validate(&self, source: &str) -> Result<()> {
        validate_source(source)
    }

    async fn snapshot_info(&self) -> Option<SnapshotInfo> {
        self.current().await.map(|s| s.info.clone())
    }
}
