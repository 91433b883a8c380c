use super::{ChatMessage, GenerationOptions, ProviderClient, ProviderKind};
use crate::config::ProviderConfig;
use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a client for one configured backend
pub fn create_client(
    kind: ProviderKind,
    config: &ProviderConfig,
    timeout: Duration,
) -> Result<Arc<dyn ProviderClient>, ConfigError> {
    match kind {
        ProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(config.clone(), timeout)?)),
        ProviderKind::LlamaCpp => Ok(Arc::new(LlamaCppProvider::new(config.clone(), timeout)?)),
        ProviderKind::YandexGpt => Ok(Arc::new(YandexGptProvider::new(config.clone(), timeout)?)),
    }
}

fn build_http_client(kind: ProviderKind, timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(HEALTH_TIMEOUT.min(timeout))
        .build()
        .map_err(|e| ConfigError::Provider {
            provider: kind,
            reason: format!("failed to build HTTP client: {}", e),
        })
}

/// Send a request and return the body of a successful response
async fn execute(
    kind: ProviderKind,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(kind, e, timeout))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(kind, e, timeout))?;

    if !status.is_success() {
        return Err(ProviderError::from_status(kind, status, &body, timeout));
    }

    Ok(body)
}

fn non_empty(kind: ProviderKind, text: &str) -> Result<String, ProviderError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ProviderError::BadResponse {
            provider: kind,
            reason: "empty completion".to_string(),
        });
    }
    Ok(text.to_string())
}

// OpenAI-compatible chat completion wire format, shared by Ollama and llama.cpp

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
}

fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    /// Legacy llama.cpp servers answer with a bare `content` field
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
    text: Option<String>,
}

pub(crate) fn parse_chat_completion(kind: ProviderKind, body: &str) -> Result<String, ProviderError> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::BadResponse {
            provider: kind,
            reason: format!("invalid JSON: {}", e),
        })?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.map(|m| m.content).or(c.text))
        .or(parsed.content)
        .ok_or_else(|| ProviderError::BadResponse {
            provider: kind,
            reason: "no choices in response".to_string(),
        })?;

    non_empty(kind, &content)
}

fn with_bearer(request: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

/// Local Ollama server through its OpenAI-compatible endpoint
pub struct OllamaProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let client = build_http_client(ProviderKind::Ollama, timeout)?;
        Ok(Self {
            config,
            client,
            timeout,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ProviderClient for OllamaProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let request = ChatCompletionRequest {
            model,
            messages: vec![ChatMessage::user(prompt)],
            stream: false,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stop: &options.stop,
        };

        let url = self.completions_url();
        debug!("Sending request to Ollama at {} (model {})", url, model);

        let builder = with_bearer(self.client.post(&url), self.config.api_key()).json(&request);
        let body = execute(ProviderKind::Ollama, builder, self.timeout).await?;
        parse_chat_completion(ProviderKind::Ollama, &body)
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.base_url.trim_end_matches('/'));
        let request = with_bearer(self.client.get(&url), self.config.api_key()).timeout(HEALTH_TIMEOUT);

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }
}

/// llama.cpp server or anything else speaking `/v1/chat/completions`
pub struct LlamaCppProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    timeout: Duration,
    default_stop: Vec<String>,
}

impl LlamaCppProvider {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let client = build_http_client(ProviderKind::LlamaCpp, timeout)?;
        Ok(Self {
            config,
            client,
            timeout,
            default_stop: vec!["</s>".to_string()],
        })
    }
}

#[async_trait]
impl ProviderClient for LlamaCppProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let stop = if options.stop.is_empty() {
            &self.default_stop
        } else {
            &options.stop
        };

        let request = ChatCompletionRequest {
            model,
            messages: vec![ChatMessage::user(prompt)],
            stream: false,
            max_tokens: Some(options.max_tokens.unwrap_or(512)),
            temperature: Some(options.temperature.unwrap_or(0.7)),
            stop,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!("Sending request to llama.cpp at {}", url);

        let builder = with_bearer(self.client.post(&url), self.config.api_key()).json(&request);
        let body = execute(ProviderKind::LlamaCpp, builder, self.timeout).await?;
        parse_chat_completion(ProviderKind::LlamaCpp, &body)
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let request = with_bearer(self.client.get(&url), self.config.api_key()).timeout(HEALTH_TIMEOUT);

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LlamaCpp
    }
}

// YandexGPT foundation models completion API

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct YandexCompletionRequest {
    model_uri: String,
    completion_options: YandexCompletionOptions,
    messages: Vec<YandexMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct YandexCompletionOptions {
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct YandexMessage {
    role: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct YandexCompletionResponse {
    result: YandexResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YandexResult {
    #[serde(default)]
    alternatives: Vec<YandexAlternative>,
    #[allow(dead_code)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YandexAlternative {
    message: YandexMessage,
}

pub(crate) fn parse_yandex_completion(body: &str) -> Result<String, ProviderError> {
    let kind = ProviderKind::YandexGpt;
    let parsed: YandexCompletionResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::BadResponse {
            provider: kind,
            reason: format!("invalid JSON: {}", e),
        })?;

    let text = parsed
        .result
        .alternatives
        .into_iter()
        .next()
        .map(|a| a.message.text)
        .ok_or_else(|| ProviderError::BadResponse {
            provider: kind,
            reason: "no alternatives in response".to_string(),
        })?;

    non_empty(kind, &text)
}

/// Yandex Cloud foundation models (YandexGPT)
///
/// Missing credentials don't fail construction: the provider stays in the
/// priority list and reports `AuthFailed` so the router falls through to the
/// next backend.
pub struct YandexGptProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl YandexGptProvider {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let client = build_http_client(ProviderKind::YandexGpt, timeout)?;
        let provider = Self {
            config,
            client,
            timeout,
        };

        if let Err(e) = provider.credentials() {
            warn!("YandexGPT configured without credentials: {}", e);
        }
        Ok(provider)
    }

    fn credentials(&self) -> Result<(&str, &str), ProviderError> {
        let api_key = self.config.api_key().ok_or_else(|| ProviderError::AuthFailed {
            provider: ProviderKind::YandexGpt,
            reason: "yandexgpt_api_key is not set".to_string(),
        })?;
        let folder_id = self
            .config
            .folder_id
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ProviderError::AuthFailed {
                provider: ProviderKind::YandexGpt,
                reason: "yandexgpt_folder_id is not set".to_string(),
            })?;
        Ok((api_key, folder_id))
    }

    fn model_uri(folder_id: &str, model: &str) -> String {
        if model.starts_with("gpt://") {
            model.to_string()
        } else {
            format!("gpt://{}/{}", folder_id, model)
        }
    }

    /// IAM tokens (`t1.` prefix) use Bearer auth, static keys use `Api-Key`.
    fn authorization(api_key: &str) -> String {
        if api_key.starts_with("t1.") {
            format!("Bearer {}", api_key)
        } else {
            format!("Api-Key {}", api_key)
        }
    }

    fn completion_request(
        folder_id: &str,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> YandexCompletionRequest {
        YandexCompletionRequest {
            model_uri: Self::model_uri(folder_id, model),
            completion_options: YandexCompletionOptions {
                stream: false,
                temperature: options.temperature.unwrap_or(0.6),
                max_tokens: options.max_tokens.unwrap_or(2000),
            },
            messages: vec![YandexMessage {
                role: "user".to_string(),
                text: prompt.to_string(),
            }],
        }
    }

    fn post(&self, api_key: &str, folder_id: &str, request: &YandexCompletionRequest) -> reqwest::RequestBuilder {
        self.client
            .post(&self.config.base_url)
            .header("Authorization", Self::authorization(api_key))
            .header("x-folder-id", folder_id)
            .json(request)
    }
}

#[async_trait]
impl ProviderClient for YandexGptProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let (api_key, folder_id) = self.credentials()?;
        let request = Self::completion_request(folder_id, prompt, model, options);

        debug!("Sending request to YandexGPT ({})", request.model_uri);

        let builder = self.post(api_key, folder_id, &request);
        let body = execute(ProviderKind::YandexGpt, builder, self.timeout).await?;
        parse_yandex_completion(&body)
    }

    async fn is_available(&self) -> bool {
        let Ok((api_key, folder_id)) = self.credentials() else {
            return false;
        };
        let probe = GenerationOptions {
            max_tokens: Some(1),
            ..GenerationOptions::default()
        };
        let request =
            Self::completion_request(folder_id, "Проверка", &self.config.default_model, &probe);

        match self.post(api_key, folder_id, &request).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::YandexGpt
    }
}
