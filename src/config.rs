use crate::adapters::search::{DEFAULT_MAX_RESULTS, DEFAULT_SEARCH_TIMEOUT};
use crate::domain::chunking::{FallbackChunker, DEFAULT_CHUNK_DELAY, DEFAULT_CHUNK_SIZE};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Provider used when a request names none.
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4";

const APP_DIR: &str = "research-assistant";
const LOCAL_DIR: &str = ".research-assistant";
const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "research_assistant.db";

/// Per-provider settings. Unset fields fall back to the adapter's defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Blocking generation timeout, in seconds.
    pub timeout: Option<u64>,
}

impl ProviderConfig {
    fn overlay(&self, local: &ProviderConfig) -> ProviderConfig {
        ProviderConfig {
            api_key: local.api_key.clone().or_else(|| self.api_key.clone()),
            base_url: local.base_url.clone().or_else(|| self.base_url.clone()),
            timeout: local.timeout.or(self.timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SearchConfig {
    /// Key for the keyed search backend. Without one, only keyless search runs.
    pub api_key: Option<String>,
    pub max_results: Option<usize>,
    pub timeout_secs: Option<u64>,
}

impl SearchConfig {
    pub fn max_results(&self) -> usize {
        self.max_results.unwrap_or(DEFAULT_MAX_RESULTS).max(1)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SEARCH_TIMEOUT)
    }

    fn overlay(&self, local: &SearchConfig) -> SearchConfig {
        SearchConfig {
            api_key: local.api_key.clone().or_else(|| self.api_key.clone()),
            max_results: local.max_results.or(self.max_results),
            timeout_secs: local.timeout_secs.or(self.timeout_secs),
        }
    }
}

/// Pacing of the fallback chunker used by providers without native streaming.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamingConfig {
    pub chunk_size: Option<usize>,
    pub chunk_delay_ms: Option<u64>,
}

impl StreamingConfig {
    pub fn chunker(&self) -> FallbackChunker {
        FallbackChunker::new(
            self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            self.chunk_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CHUNK_DELAY),
            std::sync::Arc::new(crate::domain::chunking::TokioPacer),
        )
    }

    fn overlay(&self, local: &StreamingConfig) -> StreamingConfig {
        StreamingConfig {
            chunk_size: local.chunk_size.or(self.chunk_size),
            chunk_delay_ms: local.chunk_delay_ms.or(self.chunk_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub default_provider: Option<String>,
    pub default_model: Option<String>,

    #[serde(default)]
    pub provider: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    pub database_path: Option<PathBuf>,
}

impl Config {
    pub fn provider(&self, name: &str) -> ProviderConfig {
        self.provider.get(name).cloned().unwrap_or_default()
    }

    pub fn default_provider(&self) -> &str {
        self.default_provider.as_deref().unwrap_or(DEFAULT_PROVIDER)
    }

    pub fn default_model(&self) -> &str {
        self.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Configured database file, or one under the user data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join(APP_DIR).join(DATABASE_FILE))
                .unwrap_or_else(|| PathBuf::from(DATABASE_FILE))
        })
    }

    fn resolve_placeholders(&mut self) {
        for provider in self.provider.values_mut() {
            resolve_opt(&mut provider.api_key);
            resolve_opt(&mut provider.base_url);
        }
        resolve_opt(&mut self.search.api_key);
        resolve_opt(&mut self.default_provider);
        resolve_opt(&mut self.default_model);
    }
}

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{env:([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));

/// Replaces `{env:VAR}` placeholders. Unset variables leave the placeholder as is.
pub fn resolve_env_var(value: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

fn resolve_opt(value: &mut Option<String>) {
    if let Some(v) = value.as_mut() {
        *v = resolve_env_var(v);
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Loads the global config and overlays the workspace-local one on top.
pub struct ConfigManager {
    global_config: Option<Config>,
    local_config: Option<Config>,
    merged_config: Config,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            global_config: None,
            local_config: None,
            merged_config: Config::default(),
        }
    }

    pub fn load(&mut self, workspace_path: Option<&Path>) -> Result<(), ConfigError> {
        let global = Self::global_config_path();
        let local = workspace_path.map(Self::local_config_path);
        self.load_paths(global.as_deref(), local.as_deref())
    }

    /// Same as [`load`](Self::load) with explicit file locations.
    pub fn load_paths(
        &mut self,
        global_path: Option<&Path>,
        local_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        self.global_config = global_path.map(Self::read_config).transpose()?.flatten();
        self.local_config = local_path.map(Self::read_config).transpose()?.flatten();
        self.merged_config = self.merge_configs();
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.merged_config
    }

    /// `~/.config/research-assistant/config.json`
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// `<workspace>/.research-assistant/config.json`
    pub fn local_config_path(workspace: &Path) -> PathBuf {
        workspace.join(LOCAL_DIR).join(CONFIG_FILE)
    }

    fn read_config(path: &Path) -> Result<Option<Config>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.resolve_placeholders();
        Ok(Some(config))
    }

    fn merge_configs(&self) -> Config {
        let mut merged = self.global_config.clone().unwrap_or_default();

        if let Some(ref local) = self.local_config {
            if local.default_provider.is_some() {
                merged.default_provider = local.default_provider.clone();
            }
            if local.default_model.is_some() {
                merged.default_model = local.default_model.clone();
            }
            for (name, value) in &local.provider {
                let base = merged.provider.get(name).cloned().unwrap_or_default();
                merged.provider.insert(name.clone(), base.overlay(value));
            }
            merged.search = merged.search.overlay(&local.search);
            merged.streaming = merged.streaming.overlay(&local.streaming);
            if local.database_path.is_some() {
                merged.database_path = local.database_path.clone();
            }
        }

        merged
    }

    pub fn save_config(config: &Config, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
