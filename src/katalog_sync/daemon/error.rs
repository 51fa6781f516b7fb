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

use std::error::Error;
use std::fmt;

use crate::katalog_sync::daemon::pod::{ANNOTATION_SERVICE_NAMES, ANNOTATION_SIDECAR};

/// Failure kinds surfaced by the sync engine and its RPC surface. Results
/// are fanned out to every caller waiting on a sweep, so variants carry
/// owned strings rather than error sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No pod with the service-names annotation matches the cache key.
    PodNotFound { key: String },
    /// The pod exists but carries no sidecar annotation.
    MisconfiguredSidecar { key: String },
    /// The annotated sidecar container is absent from the container statuses.
    SidecarMissing { container: String },
    /// An annotation carried an unparseable duration.
    BadDuration {
        annotation: String,
        value: String,
        detail: String,
    },
    /// The kubelet, agent, or catalog could not be reached.
    Upstream { what: String, detail: String },
    /// One or more per-service sync attempts recorded an error.
    SyncFailed { detail: String },
    /// The pod did not derive ready at the end of the handshake.
    NotReady { detail: String },
    /// The caller went away or the pod was removed mid-operation.
    Cancelled,
}

impl SyncError {
    pub fn upstream(what: &str, err: impl fmt::Display) -> Self {
        SyncError::Upstream {
            what: what.to_string(),
            detail: err.to_string(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::PodNotFound { key } => write!(
                f,
                "Unable to find pod with katalog-sync annotation ({ANNOTATION_SERVICE_NAMES}): {key}"
            ),
            SyncError::MisconfiguredSidecar { key } => write!(
                f,
                "Pod {key} is missing annotation {ANNOTATION_SIDECAR} for sidecar"
            ),
            SyncError::SidecarMissing { container } => {
                write!(f, "Unable to find sidecar container {container}")
            }
            SyncError::BadDuration {
                annotation,
                value,
                detail,
            } => write!(f, "Invalid duration {value:?} in annotation {annotation}: {detail}"),
            SyncError::Upstream { what, detail } => write!(f, "{what} unavailable: {detail}"),
            SyncError::SyncFailed { detail } => write!(f, "Unable to sync status: {detail}"),
            SyncError::NotReady { detail } => write!(f, "not ready: {detail}"),
            SyncError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl Error for SyncError {}
