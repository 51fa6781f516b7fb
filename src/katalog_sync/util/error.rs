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

//! Error helpers for the upstream plumbing (kubelet, consul, apiserver).
//!
//! The client paths move `Box<dyn Error + Send + Sync>` around and attach
//! context as errors bubble up; the typed [`SyncError`] kinds live in the
//! daemon module and are built from these at the RPC boundary.
//!
//! [`SyncError`]: crate::katalog_sync::daemon::SyncError

use std::error::Error;
use std::fmt;

#[derive(Debug)]
struct UpstreamError {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source.as_ref() {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Error for UpstreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn Error + 'static))
    }
}

/// A standalone error carrying only a message.
pub fn new_error(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(UpstreamError {
        message: message.into(),
        source: None,
    })
}

/// Wrap `error` with a message describing what was being attempted.
pub fn with_context<E>(error: E, context: impl Into<String>) -> Box<dyn Error + Send + Sync>
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    Box::new(UpstreamError {
        message: context.into(),
        source: Some(error.into()),
    })
}
