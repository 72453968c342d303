//! The static registry table. Additions and removals are compile-time changes.

use super::{Grade, ModelDefaults, ModelDescriptor, ModelTraits, Provider};
use crate::types::{ReasoningEffort, Verbosity};

fn entry(
    provider: Provider,
    name: &'static str,
    reasoning: bool,
    structured_output: bool,
    defaults: ModelDefaults,
    capabilities: ModelTraits,
) -> ModelDescriptor {
    ModelDescriptor {
        id: format!("{provider}:{name}"),
        provider,
        name,
        reasoning,
        structured_output,
        defaults,
        capabilities,
    }
}

fn traits(
    speed: Grade,
    intelligence: Grade,
    context_window: u32,
    vision: bool,
    audio: bool,
) -> ModelTraits {
    ModelTraits {
        speed,
        intelligence,
        context_window: Some(context_window),
        vision,
        audio,
    }
}

fn effort(level: ReasoningEffort) -> ModelDefaults {
    ModelDefaults {
        reasoning_effort: Some(level),
        verbosity: None,
    }
}

fn effort_verbosity(level: ReasoningEffort, verbosity: Verbosity) -> ModelDefaults {
    ModelDefaults {
        reasoning_effort: Some(level),
        verbosity: Some(verbosity),
    }
}

/// One descriptor per `(provider, name)`.
pub fn builtin_models() -> Vec<ModelDescriptor> {
    use Grade::*;
    use Provider::*;

    vec![
        // OpenAI
        entry(
            OpenAi,
            "gpt-5",
            true,
            true,
            effort_verbosity(ReasoningEffort::Medium, Verbosity::Medium),
            traits(Medium, High, 400_000, true, false),
        ),
        entry(
            OpenAi,
            "gpt-5-mini",
            true,
            true,
            effort_verbosity(ReasoningEffort::Low, Verbosity::Low),
            traits(High, Medium, 400_000, true, false),
        ),
        entry(
            OpenAi,
            "gpt-5-nano",
            true,
            true,
            effort_verbosity(ReasoningEffort::Minimal, Verbosity::Low),
            traits(High, Low, 400_000, true, false),
        ),
        entry(
            OpenAi,
            "gpt-4.1",
            false,
            true,
            ModelDefaults::default(),
            traits(Medium, Medium, 1_000_000, true, false),
        ),
        entry(
            OpenAi,
            "gpt-4.1-mini",
            false,
            true,
            ModelDefaults::default(),
            traits(High, Medium, 1_000_000, true, false),
        ),
        entry(
            OpenAi,
            "o3",
            true,
            true,
            effort(ReasoningEffort::Medium),
            traits(Low, High, 200_000, true, false),
        ),
        entry(
            OpenAi,
            "o4-mini",
            true,
            true,
            effort(ReasoningEffort::Medium),
            traits(Medium, Medium, 200_000, true, false),
        ),
        // Google
        entry(
            Google,
            "gemini-2.5-pro",
            false,
            true,
            ModelDefaults::default(),
            traits(Medium, High, 1_000_000, true, true),
        ),
        entry(
            Google,
            "gemini-2.5-flash",
            false,
            true,
            ModelDefaults::default(),
            traits(High, Medium, 1_000_000, true, true),
        ),
        entry(
            Google,
            "gemini-2.5-flash-lite",
            false,
            true,
            ModelDefaults::default(),
            traits(High, Low, 1_000_000, true, false),
        ),
        entry(
            Google,
            "gemini-2.0-flash",
            false,
            true,
            ModelDefaults::default(),
            traits(High, Low, 1_000_000, true, true),
        ),
        // Anthropic: structured output goes through instruction fallback,
        // not a schema-constrained endpoint.
        entry(
            Anthropic,
            "claude-opus-4-5",
            false,
            false,
            ModelDefaults::default(),
            traits(Low, High, 200_000, true, false),
        ),
        entry(
            Anthropic,
            "claude-sonnet-4-5",
            false,
            false,
            ModelDefaults::default(),
            traits(Medium, High, 200_000, true, false),
        ),
        entry(
            Anthropic,
            "claude-haiku-3-5",
            false,
            false,
            ModelDefaults::default(),
            traits(High, Medium, 200_000, true, false),
        ),
        // xAI
        entry(
            Xai,
            "grok-4",
            false,
            true,
            ModelDefaults::default(),
            traits(Medium, High, 256_000, true, false),
        ),
        entry(
            Xai,
            "grok-3",
            false,
            true,
            ModelDefaults::default(),
            traits(Medium, Medium, 131_072, false, false),
        ),
        entry(
            Xai,
            "grok-3-mini",
            true,
            true,
            effort(ReasoningEffort::Low),
            traits(High, Low, 131_072, false, false),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let models = builtin_models();
        let mut ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), models.len());
    }

    #[test]
    fn every_provider_has_models() {
        let models = builtin_models();
        for provider in Provider::all() {
            assert!(
                models.iter().any(|m| m.provider == provider),
                "no models for {provider}"
            );
        }
    }

    #[test]
    fn reasoning_models_carry_a_default_effort() {
        for model in builtin_models() {
            if model.reasoning {
                assert!(
                    model.defaults.reasoning_effort.is_some(),
                    "{} is reasoning-class but has no default effort",
                    model.id
                );
            }
        }
    }
}
