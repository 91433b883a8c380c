//! Slidecast - document to narrated slide video
//!
//! Splits a document into scenes, simplifies each scene through a
//! prioritized set of LLM providers (Ollama, llama.cpp, YandexGPT) with
//! fallback, then renders an illustrated, narrated slide per scene.

pub mod config;
pub mod error;
pub mod llm;
pub mod media;
pub mod processing;
pub mod scenes;
pub mod state;

// Re-export main types for easy access
pub use crate::config::{Config, ConfigBuilder, FailurePolicy};
pub use crate::error::{AllProvidersFailedError, ConfigError, PipelineStageError, ProviderError};
pub use crate::llm::{GenerationRequest, GenerationResult, ProviderKind, ProviderRegistry, Router, TaskType};
pub use crate::media::{ExternalTools, MediaBackend, Slide, SlideRequest};
pub use crate::processing::{PipelineOrchestrator, RunReport, SceneIssue};
pub use crate::scenes::{Scene, SceneSplitter};
pub use crate::state::{ArtifactLayout, SceneStage};
