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
use std::error::Error;
use std::fs;
use std::time::Duration;

use crate::katalog_sync::config::KubeletClientConfig;
use crate::katalog_sync::k8s::pod::PodList;
use crate::katalog_sync::util::error::{new_error, with_context};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Seam for the kubelet-local pod inventory.
#[async_trait]
pub trait PodSource: Send + Sync {
    async fn get_pod_list(&self) -> Result<PodList, Box<dyn Error + Send + Sync>>;
}

/// HTTP client for the kubelet `/pods` endpoint. When the pod's
/// service-account token is mounted it is sent as a bearer token, which is
/// required for the authenticated kubelet port.
pub struct KubeletClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl KubeletClient {
    pub fn new(config: &KubeletClientConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut builder = reqwest::Client::builder().timeout(LIST_TIMEOUT);
        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|err| with_context(err, "Failed to build kubelet client"))?;

        let token = fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        Ok(Self {
            client,
            endpoint: config.api_endpoint.clone(),
            token,
        })
    }
}

#[async_trait]
impl PodSource for KubeletClient {
    async fn get_pod_list(&self) -> Result<PodList, Box<dyn Error + Send + Sync>> {
        let mut request = self.client.get(&self.endpoint);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| with_context(err, format!("Failed to reach kubelet at {}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(new_error(format!(
                "Kubelet pod listing failed: {status} from {}",
                self.endpoint
            )));
        }

        let list = response
            .json::<PodList>()
            .await
            .map_err(|err| with_context(err, "Failed to decode kubelet pod list"))?;
        Ok(list)
    }
}
