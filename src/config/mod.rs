//! Runtime settings derived from the environment at startup.

use std::path::PathBuf;

use crate::models::{Provider, ProviderBinding};

/// Default path of the conversation store.
const DEFAULT_DB_PATH: &str = "chat.db";

/// Immutable process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bindings: Vec<ProviderBinding>,
    pub db_path: PathBuf,
}

impl Settings {
    /// Load from environment variables (OPENAI_API_KEY, GOOGLE_API_KEY, ...).
    ///
    /// A provider binding exists iff one of its key variables is non-empty;
    /// the first non-empty variable wins.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error

        let bindings = Provider::all()
            .into_iter()
            .filter_map(|provider| {
                let api_key = provider
                    .api_key_vars()
                    .iter()
                    .filter_map(|var| std::env::var(var).ok())
                    .find(|value| !value.trim().is_empty())?;
                let base_url = std::env::var(provider.base_url_var())
                    .ok()
                    .filter(|value| !value.trim().is_empty());
                Some(ProviderBinding {
                    provider,
                    api_key,
                    base_url,
                })
            })
            .collect();

        let db_path = std::env::var("SIBYL_DB_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        Self { bindings, db_path }
    }
}
