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

mod client;
pub mod types;

pub use client::HttpConsul;

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;

use types::{AgentService, AgentServiceRegistration, CatalogNode, QueryMeta, QueryOptions};

/// Interface for the node-local consul agent's service and check APIs.
#[async_trait]
pub trait ConsulAgent: Send + Sync {
    /// Snapshot of the services registered with the local agent, keyed by id.
    async fn services(&self) -> Result<HashMap<String, AgentService>, Box<dyn Error + Send + Sync>>;

    async fn service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn service_deregister(&self, service_id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Refresh a TTL check, attaching free-form output.
    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// The agent's node name in the cluster catalog.
    async fn node_name(&self) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Aggregated health of a service instance on the local agent.
    async fn agent_health_service_by_id(
        &self,
        service_id: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Interface for the cluster-wide catalog's blocking node query.
#[async_trait]
pub trait ConsulCatalog: Send + Sync {
    /// Query the catalog entry for a node. When `opts.wait_index` is non-zero
    /// the server blocks until the catalog index advances past it.
    async fn node(
        &self,
        node: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<CatalogNode>, QueryMeta), Box<dyn Error + Send + Sync>>;
}
