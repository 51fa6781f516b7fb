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

pub mod daemon;
pub mod sidecar;

use crate::katalog_sync::logger::{self, LogFormat, LogLevel};

/// Apply the shared logging flags. Unknown values fall back to the defaults
/// with a warning rather than refusing to start.
pub(crate) fn init_logging(level: &str, format: &str) {
    match LogLevel::parse(level) {
        Some(level) => logger::set_min_level(level),
        None => {
            logger::set_min_level(LogLevel::Info);
            logger::log_warn("cli", "Unknown log level, using info", &[("value", level)]);
        }
    }
    match format.trim().to_ascii_lowercase().as_str() {
        "json" => logger::set_log_format(LogFormat::Json),
        "text" => logger::set_log_format(LogFormat::Text),
        other => {
            logger::set_log_format(LogFormat::Text);
            logger::log_warn("cli", "Unknown log format, using text", &[("value", other)]);
        }
    }
}
