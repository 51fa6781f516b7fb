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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const HEALTH_PASSING: &str = "passing";
pub const HEALTH_WARNING: &str = "warning";
pub const HEALTH_CRITICAL: &str = "critical";

/// A service instance as reported by the agent services API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Service", default)]
    pub service: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Port", default)]
    pub port: i32,
    #[serde(rename = "Address", default)]
    pub address: String,
}

/// TTL check attached to a service registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Notes")]
    pub notes: String,
}

/// Payload for the agent service registration API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags", skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Port")]
    pub port: i32,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Check")]
    pub check: AgentServiceCheck,
}

/// Node identity inside a catalog node response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "Node", default)]
    pub node: String,
    #[serde(rename = "Address", default)]
    pub address: String,
}

/// Catalog view of one node and the services it exposes cluster-wide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogNode {
    #[serde(rename = "Node", default)]
    pub node: Node,
    #[serde(rename = "Services", default)]
    pub services: HashMap<String, AgentService>,
}

/// Client-side options for catalog queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Allow any server to answer, not just the leader.
    pub allow_stale: bool,
    /// Allow agent-cached answers.
    pub use_cache: bool,
    /// Blocking-query index; zero means return immediately.
    pub wait_index: u64,
}

/// Server-side metadata accompanying a catalog response.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryMeta {
    pub last_index: u64,
}
