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

pub mod error;

use std::collections::HashMap;

/// Parse a `k:v,k:v` annotation value into a map. Pairs that do not split
/// into exactly two parts are dropped; keys and values are trimmed.
pub fn parse_map(s: &str) -> HashMap<String, String> {
    let mut m = HashMap::new();
    for pair in s.split(',') {
        let split: Vec<&str> = pair.split(':').collect();
        if split.len() != 2 {
            continue;
        }
        m.insert(split[0].trim().to_string(), split[1].trim().to_string());
    }
    m
}

/// Split a comma-separated annotation value, preserving the raw entries.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(|part| part.to_string()).collect()
}

/// Format a duration the way the consul API expects TTLs: `500ms`, `10s`,
/// `10.5s`. (Consul parses Go duration syntax, which has no spaces.)
pub fn format_ttl(duration: std::time::Duration) -> String {
    if duration < std::time::Duration::from_secs(1) {
        return format!("{}ms", duration.as_millis());
    }
    if duration.subsec_nanos() == 0 {
        return format!("{}s", duration.as_secs());
    }
    let seconds = duration.as_secs_f64();
    let mut formatted = format!("{seconds:.3}");
    while formatted.ends_with('0') {
        formatted.pop();
    }
    if formatted.ends_with('.') {
        formatted.pop();
    }
    format!("{formatted}s")
}
