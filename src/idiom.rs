//! The idiom tool: ecosystem-idiomatic approach advice through the same
//! structured advice path, rendered to markdown.

use serde::Deserialize;
use serde_json::Value;

use crate::engine::sync::StructuredOutcome;

pub const IDIOM_SCHEMA_NAME: &str = "idiom_advice";

/// Fixed system prompt framing the model as an ecosystem advisor.
pub const SYSTEM_PROMPT: &str = "\
You are an expert software ecosystem advisor. Given a task, recommend the \
idiomatic approach for the caller's language and ecosystem: which \
well-maintained packages to build on, which patterns the community has \
converged on, and which superficially attractive approaches to avoid. \
Prefer boring, widely deployed dependencies over novelty. When the caller \
names their dependencies, work with those versions instead of suggesting \
replacements. Ground every recommendation in how the ecosystem actually \
writes this kind of code, and include a short, realistic example.";

/// Schema of the structured idiom reply.
pub fn idiom_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "approach": {
                "type": "string",
                "description": "Recommended approach, one paragraph"
            },
            "packages_to_use": {
                "type": "array",
                "items": {"type": "string"}
            },
            "anti_patterns": {
                "type": "array",
                "items": {"type": "string"}
            },
            "example_code": {
                "type": "string"
            },
            "rationale": {
                "type": "string"
            },
            "references": {
                "type": "array",
                "items": {"type": "string"}
            }
        },
        "required": ["approach", "packages_to_use", "anti_patterns", "example_code", "rationale"]
    })
}

/// Assemble the user prompt from the tool arguments.
pub fn build_prompt(task: &str, current_approach: Option<&str>, context: Option<&Value>) -> String {
    let mut prompt = format!("Task: {task}");
    if let Some(approach) = current_approach {
        if !approach.trim().is_empty() {
            prompt.push_str("\n\nCurrent approach:\n");
            prompt.push_str(approach);
        }
    }
    if let Some(context) = context {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(&serde_json::to_string_pretty(context).unwrap_or_default());
    }
    prompt
}

#[derive(Debug, Deserialize)]
struct IdiomReply {
    approach: String,
    packages_to_use: Vec<String>,
    anti_patterns: Vec<String>,
    example_code: String,
    rationale: String,
    #[serde(default)]
    references: Option<Vec<String>>,
}

/// Render the structured reply as markdown; text-mode fallback passes the
/// raw reply through.
pub fn render(outcome: &StructuredOutcome) -> String {
    let reply = outcome
        .json
        .clone()
        .and_then(|json| serde_json::from_value::<IdiomReply>(json).ok());

    let Some(reply) = reply else {
        return outcome.text.clone();
    };

    let mut out = String::new();
    out.push_str("## Recommended approach\n\n");
    out.push_str(&reply.approach);
    out.push_str("\n\n### Packages\n\n");
    for package in &reply.packages_to_use {
        out.push_str("- ");
        out.push_str(package);
        out.push('\n');
    }
    out.push_str("\n### Anti-patterns to avoid\n\n");
    for anti in &reply.anti_patterns {
        out.push_str("- ");
        out.push_str(anti);
        out.push('\n');
    }
    out.push_str("\n### Example\n\n```\n");
    out.push_str(reply.example_code.trim_end());
    out.push_str("\n```\n\n### Rationale\n\n");
    out.push_str(&reply.rationale);
    if let Some(references) = &reply.references {
        if !references.is_empty() {
            out.push_str("\n\n### References\n\n");
            for reference in references {
                out.push_str("- ");
                out.push_str(reference);
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;

    #[test]
    fn prompt_includes_sections_when_present() {
        let context = serde_json::json!({"language": "rust", "dependencies": ["tokio"]});
        let prompt = build_prompt("parse a config file", Some("regex"), Some(&context));
        assert!(prompt.starts_with("Task: parse a config file"));
        assert!(prompt.contains("Current approach:\nregex"));
        assert!(prompt.contains("\"language\": \"rust\""));

        let bare = build_prompt("parse a config file", None, None);
        assert_eq!(bare, "Task: parse a config file");
    }

    #[test]
    fn render_produces_markdown_sections() {
        let outcome = StructuredOutcome {
            json: Some(serde_json::json!({
                "approach": "Use serde with a typed struct.",
                "packages_to_use": ["serde", "toml"],
                "anti_patterns": ["hand-rolled parsing"],
                "example_code": "let cfg: Config = toml::from_str(&raw)?;",
                "rationale": "Typed deserialization catches errors early.",
            })),
            text: String::new(),
            usage: Usage::default(),
            fallback_mode: false,
        };
        let rendered = render(&outcome);
        assert!(rendered.contains("## Recommended approach"));
        assert!(rendered.contains("- serde"));
        assert!(rendered.contains("### Anti-patterns to avoid"));
        assert!(rendered.contains("toml::from_str"));
        assert!(!rendered.contains("### References"));
    }

    #[test]
    fn render_falls_back_to_raw_text() {
        let outcome = StructuredOutcome {
            json: None,
            text: "plain advice".into(),
            usage: Usage::default(),
            fallback_mode: true,
        };
        assert_eq!(render(&outcome), "plain advice");
    }
}
