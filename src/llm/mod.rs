pub mod prompts;
pub mod providers;
pub mod registry;
pub mod router;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::ProviderError;

pub use registry::ProviderRegistry;
pub use router::{GenerationRequest, GenerationResult, Router};

/// LLM backends the router can dispatch to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    LlamaCpp,
    YandexGpt,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Ollama, Self::LlamaCpp, Self::YandexGpt];

    /// Short key used in priority lists and on the command line
    pub fn key(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::LlamaCpp => "llamacpp",
            Self::YandexGpt => "yandexgpt",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "llamacpp" => Ok(Self::LlamaCpp),
            "yandexgpt" => Ok(Self::YandexGpt),
            other => Err(format!(
                "unknown provider '{}', expected one of: ollama, llamacpp, yandexgpt",
                other
            )),
        }
    }
}

/// Kind of work a request carries; selects priority list and model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Text,
    Code,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Code => f.write_str("code"),
        }
    }
}

fn code_indicators() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(def|class|function)\s+\w+\s*\(.*\)\s*(\{|:)",
            r"(if|for|while)\s*\(.*\)\s*(\{|:)",
            r"(var|let|const|int|float|double|string|bool)\s+\w+\s*=",
            r"import\s+[\w\s\{\},\.]+\s+from",
            r#"#include\s+[<"].*[>"]"#,
            r"public\s+(static\s+)?(class|void|int|String)",
            r#"<\w+(\s+\w+=".*")*>.*</\w+>"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

impl TaskType {
    /// Classify free text as code when it carries source-code markers.
    pub fn detect(text: &str) -> Self {
        if code_indicators().iter().any(|re| re.is_match(text)) {
            Self::Code
        } else {
            Self::Text
        }
    }
}

/// Sampling knobs passed through to the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// Chat message for LLM communication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Uniform completion contract over every backend.
///
/// Implementations make exactly one outbound call per `generate` and never
/// retry; retry and fallback live in [`Router`].
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<String, ProviderError>;

    async fn is_available(&self) -> bool;

    fn kind(&self) -> ProviderKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!(" LlamaCpp ".parse::<ProviderKind>().unwrap(), ProviderKind::LlamaCpp);
        assert_eq!("yandexgpt".parse::<ProviderKind>().unwrap(), ProviderKind::YandexGpt);
        assert!("openai".parse::<ProviderKind>().is_err());

        for kind in ProviderKind::ALL {
            assert_eq!(kind.key().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_task_type_detection() {
        let code = "def calculate_sum(a, b):\n    return a + b";
        assert_eq!(TaskType::detect(code), TaskType::Code);
        assert_eq!(TaskType::detect("#include <stdio.h>"), TaskType::Code);

        let prose = "Искусственный интеллект — это область компьютерных наук.";
        assert_eq!(TaskType::detect(prose), TaskType::Text);
    }
}
