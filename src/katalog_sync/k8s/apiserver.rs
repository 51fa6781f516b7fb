/*
 * Copyright (C) 2025 The Katalog-sync Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use async_trait::async_trait;
use serde_json::{json, Value};
use std::env;
use std::error::Error;
use std::fs;
use std::time::Duration;

use crate::katalog_sync::k8s::pod::{Pod, PodCondition};
use crate::katalog_sync::util::error::{new_error, with_context};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";
const PATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Seam for publishing a pod condition through the orchestrator API.
#[async_trait]
pub trait PodStatusPatcher: Send + Sync {
    /// Apply a strategic-merge patch against `pods/<name>/status`.
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Builds the strategic-merge patch for a single pod condition. The new
/// document carries only the pod UID (a precondition for the apiserver) and
/// the one condition; strategic merge keys `status.conditions` by `type`, so
/// the patch appends or updates exactly that condition.
pub fn build_pod_condition_patch(pod: &Pod, condition: &PodCondition) -> Value {
    json!({
        "metadata": {
            "uid": pod.metadata.uid.clone().unwrap_or_default(),
        },
        "status": {
            "conditions": [condition],
        },
    })
}

/// Apiserver client using the pod's mounted service-account credentials.
pub struct InClusterPatcher {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl InClusterPatcher {
    pub fn new() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| new_error("KUBERNETES_SERVICE_HOST is not set; not running in-cluster"))?;
        let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let token = fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|err| with_context(err, "Failed to read service account token"))?
            .trim()
            .to_string();
        let ca = fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .map_err(|err| with_context(err, "Failed to read service account CA bundle"))?;
        let certificate = reqwest::Certificate::from_pem(&ca)
            .map_err(|err| with_context(err, "Failed to parse service account CA bundle"))?;
        let client = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .timeout(PATCH_TIMEOUT)
            .build()
            .map_err(|err| with_context(err, "Failed to build apiserver client"))?;

        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            token,
        })
    }
}

#[async_trait]
impl PodStatusPatcher for InClusterPatcher {
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/status",
            self.base_url, namespace, name
        );
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .json(patch)
            .send()
            .await
            .map_err(|err| with_context(err, format!("Failed to patch status of {namespace}/{name}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(new_error(format!(
                "Apiserver rejected status patch for {namespace}/{name}: {status} {body}"
            )));
        }
        Ok(())
    }
}

/// Stand-in patcher for daemons running without in-cluster credentials;
/// every patch attempt fails with the recorded reason so the sweep logs it.
pub struct UnavailablePatcher {
    reason: String,
}

impl UnavailablePatcher {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PodStatusPatcher for UnavailablePatcher {
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        _patch: &Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        Err(new_error(format!(
            "Cannot patch status of {namespace}/{name}: {}",
            self.reason
        )))
    }
}
