//! Environment configuration

use std::path::PathBuf;

/// Remote retrieval/LLM endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalConfig {
    /// Base URL; no HTTP answerers are registered without it
    pub url: Option<String>,
    /// Model ids served by that endpoint
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    /// Directory of `*.json` FSM definitions loaded at startup
    pub fsm_dir: Option<PathBuf>,
    pub retrieval: RetrievalConfig,
    /// Model used by the `answer_with_llm` action
    pub default_model: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = var("BROKER_DB_PATH").map_or_else(default_db_path, PathBuf::from);
        let port = var("BROKER_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);
        let models: Vec<String> = var("RETRIEVAL_MODELS")
            .map(|m| {
                m.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let default_model = var("DEFAULT_MODEL").or_else(|| models.first().cloned());

        Self {
            db_path,
            port,
            fsm_dir: var("BROKER_FSM_DIR").map(PathBuf::from),
            retrieval: RetrievalConfig {
                url: var("RETRIEVAL_URL").filter(|u| !u.is_empty()),
                models,
            },
            default_model,
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".fsm-broker").join("broker.db")
}
