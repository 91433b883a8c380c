use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::providers::create_client;
use super::{ProviderClient, ProviderKind, TaskType};
use crate::config::{Config, ProviderConfig};
use crate::error::ConfigError;

/// Parse a separator-delimited priority list into provider kinds.
///
/// Empty lists, unknown names and duplicates are configuration errors.
pub fn parse_priority(
    list: &'static str,
    raw: &str,
    separator: &str,
) -> Result<Vec<ProviderKind>, ConfigError> {
    let separator = if separator.is_empty() { "," } else { separator };
    let mut kinds = Vec::new();

    for name in raw.split(separator).map(str::trim).filter(|n| !n.is_empty()) {
        let kind: ProviderKind = name.parse().map_err(|_| ConfigError::UnknownProvider {
            list,
            name: name.to_string(),
        })?;
        if kinds.contains(&kind) {
            return Err(ConfigError::DuplicateProvider {
                list,
                name: name.to_string(),
            });
        }
        kinds.push(kind);
    }

    if kinds.is_empty() {
        return Err(ConfigError::EmptyPriority { list });
    }
    Ok(kinds)
}

/// A configured backend ready to be called
#[derive(Clone)]
pub struct RegisteredProvider {
    pub kind: ProviderKind,
    pub config: ProviderConfig,
    pub client: Arc<dyn ProviderClient>,
}

/// Configured clients plus per-task priority ordering.
///
/// Built once at startup and shared read-only afterwards.
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, RegisteredProvider>,
    priorities: HashMap<TaskType, Vec<ProviderKind>>,
}

impl ProviderRegistry {
    /// Build clients for every provider referenced by either priority list
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let text = config.routing.priority(TaskType::Text)?;
        let code = config.routing.priority(TaskType::Code)?;

        let mut needed: Vec<ProviderKind> = text.clone();
        for kind in &code {
            if !needed.contains(kind) {
                needed.push(*kind);
            }
        }

        let timeout = config.routing.timeout();
        let mut providers = HashMap::new();
        for kind in needed {
            let provider_config = config.providers.get(kind).clone();
            let client = create_client(kind, &provider_config, timeout)?;
            providers.insert(
                kind,
                RegisteredProvider {
                    kind,
                    config: provider_config,
                    client,
                },
            );
        }

        info!(
            "🔌 Provider registry ready: text=[{}] code=[{}]",
            join(&text),
            join(&code)
        );

        let mut priorities = HashMap::new();
        priorities.insert(TaskType::Text, text);
        priorities.insert(TaskType::Code, code);

        Ok(Self {
            providers,
            priorities,
        })
    }

    /// Registry holding one provider for every task type, with no fallback
    pub fn forced(config: &Config, kind: ProviderKind) -> Result<Self, ConfigError> {
        let provider_config = config.providers.get(kind).clone();
        let client = create_client(kind, &provider_config, config.routing.timeout())?;

        info!("🔒 Forcing provider {} for all tasks", kind);
        Ok(Self::with_clients(
            vec![(provider_config, client)],
            vec![kind],
            vec![kind],
        ))
    }

    /// Build a registry from already-constructed clients
    pub fn with_clients(
        clients: Vec<(ProviderConfig, Arc<dyn ProviderClient>)>,
        text_priority: Vec<ProviderKind>,
        code_priority: Vec<ProviderKind>,
    ) -> Self {
        let providers = clients
            .into_iter()
            .map(|(config, client)| {
                let kind = client.kind();
                (kind, RegisteredProvider { kind, config, client })
            })
            .collect::<HashMap<_, _>>();

        let mut priorities = HashMap::new();
        for (task, list) in [(TaskType::Text, text_priority), (TaskType::Code, code_priority)] {
            let known: Vec<ProviderKind> = list
                .into_iter()
                .filter(|kind| {
                    let present = providers.contains_key(kind);
                    if !present {
                        warn!("Provider {} has no client, dropping from {} priority", kind, task);
                    }
                    present
                })
                .collect();
            priorities.insert(task, known);
        }

        Self {
            providers,
            priorities,
        }
    }

    /// Providers for a task in priority order
    pub fn resolve(&self, task: TaskType) -> Vec<&RegisteredProvider> {
        self.priorities
            .get(&task)
            .map(|kinds| kinds.iter().filter_map(|k| self.providers.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn priority(&self, task: TaskType) -> &[ProviderKind] {
        self.priorities.get(&task).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&RegisteredProvider> {
        self.providers.get(&kind)
    }

    /// Health-probe every registered provider
    pub async fn probe_all(&self) -> Vec<(ProviderKind, bool)> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| ProviderKind::ALL.iter().position(|a| a == k));

        let mut results = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let available = match self.providers.get(&kind) {
                Some(p) => p.client.is_available().await,
                None => false,
            };
            results.push((kind, available));
        }
        results
    }
}

fn join(kinds: &[ProviderKind]) -> String {
    kinds.iter().map(|k| k.key()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    #[test]
    fn test_parse_priority_order_and_whitespace() {
        let kinds = parse_priority("text_api_priority", " llamacpp , ollama,yandexgpt ", ",").unwrap();
        assert_eq!(
            kinds,
            vec![ProviderKind::LlamaCpp, ProviderKind::Ollama, ProviderKind::YandexGpt]
        );
    }

    #[test]
    fn test_parse_priority_custom_separator() {
        let kinds = parse_priority("code_api_priority", "yandexgpt;ollama", ";").unwrap();
        assert_eq!(kinds, vec![ProviderKind::YandexGpt, ProviderKind::Ollama]);
    }

    #[test]
    fn test_parse_priority_rejects_bad_lists() {
        assert!(matches!(
            parse_priority("code_api_priority", "", ","),
            Err(ConfigError::EmptyPriority { .. })
        ));
        assert!(matches!(
            parse_priority("code_api_priority", " , ", ","),
            Err(ConfigError::EmptyPriority { .. })
        ));
        assert!(matches!(
            parse_priority("text_api_priority", "ollama,gpt4all", ","),
            Err(ConfigError::UnknownProvider { name, .. }) if name == "gpt4all"
        ));
        assert!(matches!(
            parse_priority("text_api_priority", "ollama,ollama", ","),
            Err(ConfigError::DuplicateProvider { .. })
        ));
    }

    #[test]
    fn test_registry_from_config_resolves_in_order() {
        let config = ConfigBuilder::new()
            .with_text_priority("llamacpp,ollama")
            .with_code_priority("ollama")
            .build();
        let registry = ProviderRegistry::from_config(&config).unwrap();

        let text: Vec<ProviderKind> = registry.resolve(TaskType::Text).iter().map(|p| p.kind).collect();
        assert_eq!(text, vec![ProviderKind::LlamaCpp, ProviderKind::Ollama]);

        let code: Vec<ProviderKind> = registry.resolve(TaskType::Code).iter().map(|p| p.kind).collect();
        assert_eq!(code, vec![ProviderKind::Ollama]);
        assert!(registry.get(ProviderKind::YandexGpt).is_none());
    }

    #[test]
    fn test_registry_empty_code_priority_is_startup_error() {
        let config = ConfigBuilder::new().with_code_priority("").build();
        assert!(matches!(
            ProviderRegistry::from_config(&config),
            Err(ConfigError::EmptyPriority { list: "code_api_priority" })
        ));
    }

    #[test]
    fn test_registry_default_config_builds_all_providers() {
        let registry = ProviderRegistry::from_config(&Config::default()).unwrap();
        for kind in ProviderKind::ALL {
            assert!(registry.get(kind).is_some(), "{} missing", kind);
        }
        assert_eq!(registry.priority(TaskType::Text).len(), 3);
    }

    #[test]
    fn test_forced_registry_has_single_provider() {
        let config = Config::default();
        let registry = ProviderRegistry::forced(&config, ProviderKind::LlamaCpp).unwrap();
        assert_eq!(registry.priority(TaskType::Text), &[ProviderKind::LlamaCpp]);
        assert_eq!(registry.priority(TaskType::Code), &[ProviderKind::LlamaCpp]);
    }
}
