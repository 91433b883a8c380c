use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::registry::parse_priority;
use crate::llm::{ProviderKind, TaskType};

/// Configuration for slidecast
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// LLM backend connection settings
    pub providers: ProvidersConfig,

    /// Priority lists and retry policy
    pub routing: RoutingConfig,

    /// Scene splitting and worker settings
    pub pipeline: PipelineConfig,

    /// Image, voice and video tool settings
    pub media: MediaConfig,

    /// Output locations
    pub output: OutputConfig,
}

/// Connection settings for one LLM backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub code_model: Option<String>,
    pub text_model: Option<String>,
    /// Yandex Cloud folder id, only used by YandexGPT
    pub folder_id: Option<String>,
}

impl ProviderConfig {
    /// API key, treating empty and `NA` as absent
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != "NA")
    }

    /// Model to use for a task when the request doesn't override it
    pub fn model_for(&self, task: TaskType) -> &str {
        let specific = match task {
            TaskType::Code => self.code_model.as_deref(),
            TaskType::Text => self.text_model.as_deref(),
        };
        specific
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub ollama: ProviderConfig,
    pub llamacpp: ProviderConfig,
    pub yandexgpt: ProviderConfig,
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::Ollama => &self.ollama,
            ProviderKind::LlamaCpp => &self.llamacpp,
            ProviderKind::YandexGpt => &self.yandexgpt,
        }
    }

    fn get_mut(&mut self, kind: ProviderKind) -> &mut ProviderConfig {
        match kind {
            ProviderKind::Ollama => &mut self.ollama,
            ProviderKind::LlamaCpp => &mut self.llamacpp,
            ProviderKind::YandexGpt => &mut self.yandexgpt,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            ollama: ProviderConfig {
                base_url: "http://localhost:11434".to_string(),
                api_key: None,
                default_model: "llama3".to_string(),
                code_model: Some("codellama".to_string()),
                text_model: Some("llama3".to_string()),
                folder_id: None,
            },
            llamacpp: ProviderConfig {
                base_url: "http://localhost:8080/v1".to_string(),
                api_key: None,
                default_model: "default".to_string(),
                code_model: None,
                text_model: None,
                folder_id: None,
            },
            yandexgpt: ProviderConfig {
                base_url: "https://llm.api.cloud.yandex.net/foundationModels/v1/completion".to_string(),
                api_key: None,
                default_model: "yandexgpt".to_string(),
                code_model: None,
                text_model: None,
                folder_id: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    /// Ordered providers for text tasks, e.g. "ollama,llamacpp,yandexgpt"
    pub text_api_priority: String,

    /// Ordered providers for code tasks
    pub code_api_priority: String,

    /// Separator between provider names in the priority lists
    pub priority_separator: String,

    /// Extra attempts against the same provider on transient faults
    pub max_retries: u32,

    /// Per-call timeout in seconds
    pub timeout_seconds: u64,

    /// Pause between same-provider retries in milliseconds
    pub retry_backoff_ms: u64,

    /// Temperature for simplification requests (backend default when unset)
    pub temperature: Option<f32>,

    /// Token cap for simplification requests (backend default when unset)
    pub max_tokens: Option<u32>,
}

impl RoutingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Parsed priority list for a task type
    pub fn priority(&self, task: TaskType) -> Result<Vec<ProviderKind>, ConfigError> {
        match task {
            TaskType::Text => parse_priority("text_api_priority", &self.text_api_priority, &self.priority_separator),
            TaskType::Code => parse_priority("code_api_priority", &self.code_api_priority, &self.priority_separator),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            text_api_priority: "ollama,llamacpp,yandexgpt".to_string(),
            code_api_priority: "ollama,llamacpp,yandexgpt".to_string(),
            priority_separator: ",".to_string(),
            max_retries: 1,
            timeout_seconds: 120,
            retry_backoff_ms: 500,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// What to do when one scene cannot be completed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Warn, substitute raw text or a placeholder asset, keep going
    Skip,
    /// Fail the whole run
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum characters per scene
    pub max_scene_chars: usize,

    /// Process scenes concurrently
    pub parallel: bool,

    /// Worker limit in parallel mode
    pub max_workers: usize,

    /// Per-scene failure handling
    pub failure_policy: FailurePolicy,

    /// Slide length when image or audio is a placeholder
    pub fallback_slide_seconds: f64,

    /// Route scenes that look like source code through the code priority list
    pub detect_task_type: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_scene_chars: 1200,
            parallel: false,
            max_workers: num_cpus::get().clamp(1, 3),
            failure_policy: FailurePolicy::Skip,
            fallback_slide_seconds: 5.0,
            detect_task_type: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Stable Diffusion WebUI txt2img endpoint
    pub sd_api_base: String,
    pub image_width: u32,
    pub image_height: u32,
    pub image_steps: u32,
    pub cfg_scale: f32,

    /// edge-tts voice name
    pub tts_voice: String,

    /// Output video geometry
    pub video_width: u32,
    pub video_height: u32,
    pub fps: u32,

    /// Silence appended after narration, in seconds
    pub slide_padding_seconds: f64,

    /// Subtitle font size
    pub font_size: u32,

    /// Timeout for image generation requests in seconds
    pub image_timeout_seconds: u64,

    /// Wall-clock limit for one external tool run (ffmpeg, edge-tts, ...)
    pub tool_timeout_seconds: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            sd_api_base: "http://127.0.0.1:7860/sdapi/v1/txt2img".to_string(),
            image_width: 1024,
            image_height: 768,
            image_steps: 30,
            cfg_scale: 7.5,
            tts_voice: "ru-RU-DmitryNeural".to_string(),
            video_width: 1920,
            video_height: 1080,
            fps: 24,
            slide_padding_seconds: 1.0,
            font_size: 32,
            image_timeout_seconds: 300,
            tool_timeout_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for intermediate artifacts
    pub base_dir: PathBuf,

    /// Final video path; defaults to `<base_dir>/final_video.mp4`
    pub video_path: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    pub log_level: String,
}

impl OutputConfig {
    pub fn video_path(&self) -> PathBuf {
        self.video_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("final_video.mp4"))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("outputs"),
            video_path: None,
            log_level: "info".to_string(),
        }
    }
}

const CONFIG_PATHS: [&str; 2] = ["slidecast.toml", "config/slidecast.toml"];

impl Config {
    /// Load configuration: TOML file, then `.env`, then process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let found = CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists());
                match found {
                    Some(path) => Self::from_file(path)?,
                    None => Self::default(),
                }
            }
        };

        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!("Failed to read .env file: {}", e),
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Override settings from key/value environment lookups.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        for kind in ProviderKind::ALL {
            let prefix = kind.key();
            let provider = self.providers.get_mut(kind);
            if let Some(v) = get(&format!("{}_api_base", prefix)) {
                provider.base_url = v;
            }
            if let Some(v) = get(&format!("{}_api_key", prefix)) {
                provider.api_key = Some(v);
            }
            if let Some(v) = get(&format!("{}_default_model", prefix)) {
                provider.default_model = v;
            }
            if let Some(v) = get(&format!("{}_code_model", prefix)) {
                provider.code_model = Some(v);
            }
            if let Some(v) = get(&format!("{}_text_model", prefix)) {
                provider.text_model = Some(v);
            }
        }

        if let Some(v) = get("yandexgpt_model") {
            self.providers.yandexgpt.default_model = v;
        }
        if let Some(v) = get("yandexgpt_url") {
            self.providers.yandexgpt.base_url = v;
        }
        if let Some(v) = get("yandexgpt_folder_id") {
            self.providers.yandexgpt.folder_id = Some(v);
        }

        // Priority lists are taken verbatim so an explicitly empty list fails validation
        if let Some(v) = lookup("text_api_priority") {
            self.routing.text_api_priority = v;
        }
        if let Some(v) = lookup("code_api_priority") {
            self.routing.code_api_priority = v;
        }

        if let Some(v) = get("sd_api_base") {
            self.media.sd_api_base = v;
        }
        if let Some(v) = get("tts_voice") {
            self.media.tts_voice = v;
        }
        if let Some(workers) = get("SLIDECAST_WORKERS").and_then(|w| w.parse().ok()) {
            self.pipeline.max_workers = workers;
        }
        if let Some(v) = get("SLIDECAST_OUTPUT_DIR") {
            self.output.base_dir = PathBuf::from(v);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.routing.priority(TaskType::Text)?;
        self.routing.priority(TaskType::Code)?;

        if self.pipeline.max_workers == 0 {
            return Err(invalid("pipeline.max_workers", "must be greater than 0"));
        }
        if self.pipeline.max_scene_chars == 0 {
            return Err(invalid("pipeline.max_scene_chars", "must be greater than 0"));
        }
        if self.routing.timeout_seconds == 0 {
            return Err(invalid("routing.timeout_seconds", "must be greater than 0"));
        }
        if self.media.tool_timeout_seconds == 0 {
            return Err(invalid("media.tool_timeout_seconds", "must be greater than 0"));
        }
        if self.pipeline.fallback_slide_seconds <= 0.0 {
            return Err(invalid("pipeline.fallback_slide_seconds", "must be positive"));
        }

        for kind in ProviderKind::ALL {
            let base = &self.providers.get(kind).base_url;
            url::Url::parse(base).map_err(|e| ConfigError::Provider {
                provider: kind,
                reason: format!("invalid base URL '{}': {}", base, e),
            })?;
        }

        url::Url::parse(&self.media.sd_api_base)
            .map_err(|e| invalid("media.sd_api_base", &e.to_string()))?;

        tracing::debug!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Slidecast Configuration:\n\
            - Text priority: {}\n\
            - Code priority: {}\n\
            - Retries per provider: {}\n\
            - Request timeout: {}s\n\
            - Max scene length: {} chars\n\
            - Parallel: {} ({} workers)\n\
            - Failure policy: {:?}\n\
            - Output directory: {}",
            self.routing.text_api_priority,
            self.routing.code_api_priority,
            self.routing.max_retries,
            self.routing.timeout_seconds,
            self.pipeline.max_scene_chars,
            self.pipeline.parallel,
            self.pipeline.max_workers,
            self.pipeline.failure_policy,
            self.output.base_dir.display(),
        )
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.pipeline.max_workers = workers;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.config.pipeline.parallel = parallel;
        self
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.config.output.base_dir = dir;
        self
    }

    pub fn with_max_scene_chars(mut self, max: usize) -> Self {
        self.config.pipeline.max_scene_chars = max;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.pipeline.failure_policy = policy;
        self
    }

    pub fn with_text_priority(mut self, priority: &str) -> Self {
        self.config.routing.text_api_priority = priority.to_string();
        self
    }

    pub fn with_code_priority(mut self, priority: &str) -> Self {
        self.config.routing.code_api_priority = priority.to_string();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.routing.max_retries = retries;
        self
    }

    pub fn with_retry_backoff_ms(mut self, millis: u64) -> Self {
        self.config.routing.retry_backoff_ms = millis;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
