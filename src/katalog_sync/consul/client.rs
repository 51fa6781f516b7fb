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
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use crate::katalog_sync::consul::types::{
    AgentService, AgentServiceRegistration, CatalogNode, QueryMeta, QueryOptions, HEALTH_CRITICAL,
};
use crate::katalog_sync::consul::{ConsulAgent, ConsulCatalog};
use crate::katalog_sync::util::error::{new_error, with_context};

const INDEX_HEADER: &str = "X-Consul-Index";
const AGENT_TIMEOUT: Duration = Duration::from_secs(30);
// Blocking catalog queries hold for the server-side wait (5m by default);
// the client deadline must sit comfortably past it.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(600);

/// HTTP client for the node-local consul agent and its catalog endpoints.
pub struct HttpConsul {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConsul {
    pub fn new(base_url: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| with_context(err, "Failed to build consul client"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn expect_success(
        response: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, Box<dyn Error + Send + Sync>> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(new_error(format!("{what} failed: {status} {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ConsulAgent for HttpConsul {
    async fn services(&self) -> Result<HashMap<String, AgentService>, Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .get(self.url("/v1/agent/services"))
            .timeout(AGENT_TIMEOUT)
            .send()
            .await
            .map_err(|err| with_context(err, "Failed to list agent services"))?;
        let response = Self::expect_success(response, "Agent service listing").await?;
        let services = response
            .json::<HashMap<String, AgentService>>()
            .await
            .map_err(|err| with_context(err, "Failed to decode agent services"))?;
        Ok(services)
    }

    async fn service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .timeout(AGENT_TIMEOUT)
            .json(registration)
            .send()
            .await
            .map_err(|err| {
                with_context(err, format!("Failed to register service {}", registration.id))
            })?;
        Self::expect_success(response, "Service registration").await?;
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{service_id}")))
            .timeout(AGENT_TIMEOUT)
            .send()
            .await
            .map_err(|err| with_context(err, format!("Failed to deregister service {service_id}")))?;
        Self::expect_success(response, "Service deregistration").await?;
        Ok(())
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .put(self.url(&format!("/v1/agent/check/update/{check_id}")))
            .timeout(AGENT_TIMEOUT)
            .json(&json!({ "Status": status, "Output": output }))
            .send()
            .await
            .map_err(|err| with_context(err, format!("Failed to update TTL check {check_id}")))?;
        Self::expect_success(response, "TTL check update").await?;
        Ok(())
    }

    async fn node_name(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .get(self.url("/v1/agent/self"))
            .timeout(AGENT_TIMEOUT)
            .send()
            .await
            .map_err(|err| with_context(err, "Failed to query agent self endpoint"))?;
        let response = Self::expect_success(response, "Agent self query").await?;
        let body = response
            .json::<Value>()
            .await
            .map_err(|err| with_context(err, "Failed to decode agent self response"))?;
        body.get("Config")
            .and_then(|config| config.get("NodeName"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| new_error("Agent self response is missing Config.NodeName"))
    }

    async fn agent_health_service_by_id(
        &self,
        service_id: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/agent/health/service/id/{service_id}")))
            .timeout(AGENT_TIMEOUT)
            .send()
            .await
            .map_err(|err| {
                with_context(err, format!("Failed to query health of service {service_id}"))
            })?;

        // The agent encodes the aggregated status in the HTTP status as well
        // as the body; 404 means the service is gone, which reads critical.
        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                let body = response
                    .json::<Value>()
                    .await
                    .map_err(|err| with_context(err, "Failed to decode service health response"))?;
                body.get("AggregatedStatus")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| new_error("Service health response is missing AggregatedStatus"))
            }
            StatusCode::NOT_FOUND => Ok(HEALTH_CRITICAL.to_string()),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(new_error(format!(
                    "Service health query for {service_id} failed: {status} {body}"
                )))
            }
        }
    }
}

#[async_trait]
impl ConsulCatalog for HttpConsul {
    async fn node(
        &self,
        node: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<CatalogNode>, QueryMeta), Box<dyn Error + Send + Sync>> {
        let mut request = self
            .client
            .get(self.url(&format!("/v1/catalog/node/{node}")))
            .timeout(CATALOG_TIMEOUT);
        if opts.wait_index > 0 {
            request = request.query(&[("index", opts.wait_index.to_string())]);
        }
        if opts.allow_stale {
            request = request.query(&[("stale", "")]);
        }
        if opts.use_cache {
            request = request.query(&[("cached", "")]);
        }

        let response = request
            .send()
            .await
            .map_err(|err| with_context(err, format!("Failed to query catalog node {node}")))?;
        let response = Self::expect_success(response, "Catalog node query").await?;

        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or_default();

        let catalog_node = response
            .json::<Option<CatalogNode>>()
            .await
            .map_err(|err| with_context(err, "Failed to decode catalog node response"))?;

        Ok((catalog_node, QueryMeta { last_index }))
    }
}
