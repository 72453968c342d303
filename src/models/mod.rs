//! Model definitions, the static catalog, and the registry.

pub mod catalog;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, SibylError};
use crate::types::{ReasoningEffort, Verbosity};

/// Upstream model providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Google,
    Anthropic,
    Xai,
}

impl Provider {
    /// All providers, in catalog order.
    pub fn all() -> [Provider; 4] {
        [Self::OpenAi, Self::Google, Self::Anthropic, Self::Xai]
    }

    /// Environment variables that can carry this provider's API key,
    /// in precedence order (first non-empty wins).
    pub fn api_key_vars(&self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["OPENAI_API_KEY"],
            Self::Google => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Xai => &["XAI_API_KEY", "GROK_API_KEY"],
        }
    }

    /// Human-readable hint naming the env vars for this provider.
    pub fn api_key_hint(&self) -> String {
        self.api_key_vars().join(" or ")
    }

    /// Environment variable for overriding this provider's base URL.
    pub fn base_url_var(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_BASE_URL",
            Self::Google => "GOOGLE_BASE_URL",
            Self::Anthropic => "ANTHROPIC_BASE_URL",
            Self::Xai => "XAI_BASE_URL",
        }
    }

    /// Upper bound on concurrent in-flight upstream calls.
    pub fn max_concurrency(&self) -> usize {
        match self {
            Self::OpenAi => 8,
            Self::Google => 6,
            Self::Anthropic => 6,
            Self::Xai => 4,
        }
    }
}

/// Relative grade used for advisory speed/intelligence ratings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Grade {
    Low,
    Medium,
    High,
}

/// Advisory capabilities surfaced by the `models` tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelTraits {
    pub speed: Grade,
    pub intelligence: Grade,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    pub vision: bool,
    pub audio: bool,
}

/// Default generation hints applied when the caller provides none.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,
}

/// Immutable per-process description of one registered model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Full identifier, `<provider>:<name>`.
    pub id: String,
    pub provider: Provider,
    /// Provider-native model name (what goes on the wire).
    pub name: &'static str,
    /// Accepts a reasoning-effort hint.
    pub reasoning: bool,
    /// Static default for structured-output support; a runtime probe
    /// can override it through the capability cache.
    pub structured_output: bool,
    pub defaults: ModelDefaults,
    pub capabilities: ModelTraits,
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Credentials for one provider, derived from the environment at startup.
#[derive(Clone)]
pub struct ProviderBinding {
    pub provider: Provider,
    pub api_key: String,
    pub base_url: Option<String>,
}

impl fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderBinding")
            .field("provider", &self.provider)
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// One entry of `list_detailed()`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub id: String,
    pub provider: Provider,
    pub capabilities: ModelTraits,
    pub configured: bool,
}

/// Resolves `provider:name` identifiers to descriptors and owns the
/// provider bindings, so callers depend only on model ids.
pub struct ModelRegistry {
    descriptors: Vec<ModelDescriptor>,
    bindings: HashMap<Provider, ProviderBinding>,
}

impl ModelRegistry {
    /// Build the registry from the static catalog plus the given bindings.
    /// A model is *live* iff its provider binding exists.
    pub fn new(bindings: Vec<ProviderBinding>) -> Self {
        let bindings = bindings
            .into_iter()
            .filter(|b| !b.api_key.is_empty())
            .map(|b| (b.provider, b))
            .collect();
        Self {
            descriptors: catalog::builtin_models(),
            bindings,
        }
    }

    /// Whether a binding exists for the provider.
    pub fn configured(&self, provider: Provider) -> bool {
        self.bindings.contains_key(&provider)
    }

    /// The binding for a provider, if configured.
    pub fn binding(&self, provider: Provider) -> Option<&ProviderBinding> {
        self.bindings.get(&provider)
    }

    /// Resolve an identifier to a live descriptor.
    ///
    /// The not-found error carries the full live list and, when the prefix
    /// names a known provider, that provider's live ids as suggestions.
    pub fn resolve(&self, id: &str) -> Result<&ModelDescriptor> {
        let (prefix, name) = id
            .split_once(':')
            .filter(|(p, n)| !p.is_empty() && !n.is_empty())
            .ok_or_else(|| {
                SibylError::InvalidParams(format!(
                    "invalid model identifier '{id}': expected <provider>:<name>"
                ))
            })?;

        let suggested = match Provider::from_str(prefix) {
            Ok(provider) => {
                if let Some(descriptor) = self
                    .descriptors
                    .iter()
                    .find(|d| d.provider == provider && d.name == name)
                {
                    if self.configured(provider) {
                        return Ok(descriptor);
                    }
                }
                self.ids_for(provider)
            }
            Err(_) => Vec::new(),
        };

        Err(SibylError::ModelNotFound {
            id: id.to_string(),
            available: self.list(),
            suggested,
        })
    }

    /// All live model ids, in catalog order.
    pub fn list(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .filter(|d| self.configured(d.provider))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Live descriptors for one provider.
    pub fn models_for(&self, provider: Provider) -> Vec<&ModelDescriptor> {
        if !self.configured(provider) {
            return Vec::new();
        }
        self.descriptors
            .iter()
            .filter(|d| d.provider == provider)
            .collect()
    }

    fn ids_for(&self, provider: Provider) -> Vec<String> {
        self.models_for(provider)
            .into_iter()
            .map(|d| d.id.clone())
            .collect()
    }

    /// Every catalog entry with its liveness flag.
    pub fn list_detailed(&self) -> Vec<ModelListing> {
        self.descriptors
            .iter()
            .map(|d| ModelListing {
                id: d.id.clone(),
                provider: d.provider,
                capabilities: d.capabilities.clone(),
                configured: self.configured(d.provider),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(provider: Provider) -> ProviderBinding {
        ProviderBinding {
            provider,
            api_key: "test-key".into(),
            base_url: None,
        }
    }

    #[test]
    fn provider_wire_names() {
        assert_eq!(Provider::OpenAi.to_string(), "openai");
        assert_eq!(Provider::from_str("xai").unwrap(), Provider::Xai);
        assert!(Provider::from_str("aws").is_err());
    }

    #[test]
    fn resolve_live_model() {
        let registry = ModelRegistry::new(vec![binding(Provider::OpenAi)]);
        let descriptor = registry.resolve("openai:gpt-5").unwrap();
        assert_eq!(descriptor.provider, Provider::OpenAi);
        assert_eq!(descriptor.name, "gpt-5");
        assert_eq!(descriptor.id, "openai:gpt-5");
    }

    #[test]
    fn resolve_rejects_malformed_identifiers() {
        let registry = ModelRegistry::new(vec![binding(Provider::OpenAi)]);
        for bad in ["gpt-5", ":gpt-5", "openai:", ""] {
            match registry.resolve(bad) {
                Err(SibylError::InvalidParams(message)) => {
                    assert!(message.contains("invalid model identifier"), "{message}")
                }
                other => panic!("expected invalid params for '{bad}', got {other:?}"),
            }
        }
    }

    #[test]
    fn resolve_unknown_provider_lists_available() {
        let registry = ModelRegistry::new(vec![binding(Provider::OpenAi)]);
        match registry.resolve("invalid:model") {
            Err(SibylError::ModelNotFound {
                available,
                suggested,
                ..
            }) => {
                assert!(available.contains(&"openai:gpt-5".to_string()));
                assert!(suggested.is_empty());
            }
            other => panic!("expected model-not-found, got {other:?}"),
        }
    }

    #[test]
    fn resolve_unknown_name_suggests_provider_subset() {
        let registry =
            ModelRegistry::new(vec![binding(Provider::OpenAi), binding(Provider::Google)]);
        match registry.resolve("google:gemini-99") {
            Err(SibylError::ModelNotFound { suggested, .. }) => {
                assert!(!suggested.is_empty());
                assert!(suggested.iter().all(|id| id.starts_with("google:")));
            }
            other => panic!("expected model-not-found, got {other:?}"),
        }
    }

    #[test]
    fn unconfigured_provider_has_no_live_models() {
        let registry = ModelRegistry::new(vec![binding(Provider::OpenAi)]);
        assert!(registry.configured(Provider::OpenAi));
        assert!(!registry.configured(Provider::Anthropic));
        assert!(registry.models_for(Provider::Anthropic).is_empty());
        assert!(registry.resolve("anthropic:claude-sonnet-4-5").is_err());
        assert!(registry.list().iter().all(|id| id.starts_with("openai:")));
    }

    #[test]
    fn empty_api_key_does_not_bind() {
        let registry = ModelRegistry::new(vec![ProviderBinding {
            provider: Provider::OpenAi,
            api_key: String::new(),
            base_url: None,
        }]);
        assert!(!registry.configured(Provider::OpenAi));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn list_detailed_covers_whole_catalog() {
        let registry = ModelRegistry::new(vec![binding(Provider::Xai)]);
        let listings = registry.list_detailed();
        assert_eq!(listings.len(), catalog::builtin_models().len());
        assert!(listings
            .iter()
            .all(|l| l.configured == (l.provider == Provider::Xai)));
    }
}
