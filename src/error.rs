use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::llm::{ProviderKind, TaskType};
use crate::state::SceneStage;

/// Failure of a single call to one provider.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("{provider} unreachable: {reason}")]
    Unreachable { provider: ProviderKind, reason: String },

    #[error("{provider} rejected credentials: {reason}")]
    AuthFailed { provider: ProviderKind, reason: String },

    #[error("{provider} returned a bad response: {reason}")]
    BadResponse { provider: ProviderKind, reason: String },

    #[error("{provider} timed out after {:.1}s", .elapsed.as_secs_f64())]
    Timeout { provider: ProviderKind, elapsed: Duration },
}

impl ProviderError {
    pub fn provider(&self) -> ProviderKind {
        match self {
            Self::Unreachable { provider, .. }
            | Self::AuthFailed { provider, .. }
            | Self::BadResponse { provider, .. }
            | Self::Timeout { provider, .. } => *provider,
        }
    }

    /// Network faults worth retrying against the same provider.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    /// Map a transport-level reqwest failure.
    pub fn from_reqwest(provider: ProviderKind, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                provider,
                elapsed: timeout,
            }
        } else if err.is_connect() || err.is_request() {
            Self::Unreachable {
                provider,
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            Self::BadResponse {
                provider,
                reason: format!("undecodable body: {}", err),
            }
        } else {
            Self::Unreachable {
                provider,
                reason: err.to_string(),
            }
        }
    }

    /// Map a non-success HTTP status.
    pub fn from_status(
        provider: ProviderKind,
        status: reqwest::StatusCode,
        body: &str,
        timeout: Duration,
    ) -> Self {
        let reason = format!("HTTP {}: {}", status, truncate(body, 200));
        match status.as_u16() {
            401 | 403 => Self::AuthFailed { provider, reason },
            408 => Self::Timeout {
                provider,
                elapsed: timeout,
            },
            502..=504 => Self::Unreachable { provider, reason },
            _ => Self::BadResponse { provider, reason },
        }
    }
}

/// One provider's outcome inside a routed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAttempt {
    pub provider: ProviderKind,
    pub error: ProviderError,
    /// Calls made to this provider, retries included.
    pub tries: u32,
}

/// Every provider in the priority list failed.
#[derive(thiserror::Error, Debug, Clone, Serialize)]
#[error("all providers failed for {task_type} task: {}", summarize(.attempts))]
pub struct AllProvidersFailedError {
    pub task_type: TaskType,
    pub attempts: Vec<ProviderAttempt>,
}

fn summarize(attempts: &[ProviderAttempt]) -> String {
    if attempts.is_empty() {
        return "no providers configured".to_string();
    }
    attempts
        .iter()
        .map(|a| a.error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Startup configuration problems.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{list} priority list is empty")]
    EmptyPriority { list: &'static str },

    #[error("unknown provider '{name}' in {list} priority list")]
    UnknownProvider { list: &'static str, name: String },

    #[error("provider '{name}' listed twice in {list} priority list")]
    DuplicateProvider { list: &'static str, name: String },

    #[error("provider {provider} is misconfigured: {reason}")]
    Provider { provider: ProviderKind, reason: String },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Out-of-order mutation of a scene.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("scene {index}: cannot enter {attempted:?} from {current:?}")]
pub struct SceneError {
    pub index: usize,
    pub current: SceneStage,
    pub attempted: SceneStage,
}

/// Failures that stop a pipeline run.
#[derive(thiserror::Error, Debug)]
pub enum PipelineStageError {
    #[error("text extraction failed for {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error("document {0} produced no scenes")]
    NoScenes(PathBuf),

    #[error("scene {index} failed during {stage:?}: {reason}")]
    Scene {
        index: usize,
        stage: SceneStage,
        reason: String,
    },

    #[error("scene {index} simplification failed: {source}")]
    Routing {
        index: usize,
        #[source]
        source: AllProvidersFailedError,
    },

    #[error("no slides were assembled, video not written")]
    NoSlides,

    #[error("failed to write video {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] SceneError),
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
