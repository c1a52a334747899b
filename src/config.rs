use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const TASK_QUEUE_MAX_THREADS: u16 = 4;
const BATCH_DEFAULT_LIMIT: usize = 50;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_EMBEDDING_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Seven days
const DEFAULT_MAX_SNAPSHOT_AGE_SECS: u64 = 7 * 24 * 60 * 60;
/// A hundred years
const MAX_SNAPSHOT_AGE_SECS_LIMIT: u64 = 100 * 365 * 24 * 60 * 60;

const DEFAULT_RECOMMENDATION_LIMIT: usize = 10;

const DEFAULT_ANALYSIS_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANALYSIS_MAX_TOKENS: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config file is not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP endpoint
    #[default]
    Openai,
    /// In-process model, needs the `local-embed` feature
    Fastembed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Base URL; `/embeddings` is appended
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Requested output dimensionality, for models that support it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Matches older than this are flagged stale
    #[serde(default = "default_max_snapshot_age_secs")]
    pub max_snapshot_age_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_embedding_model(),
            endpoint: default_embedding_endpoint(),
            api_key_env: default_api_key_env(),
            dimensions: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_snapshot_age_secs: DEFAULT_MAX_SNAPSHOT_AGE_SECS,
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_endpoint() -> String {
    DEFAULT_EMBEDDING_ENDPOINT.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_snapshot_age_secs() -> u64 {
    DEFAULT_MAX_SNAPSHOT_AGE_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendationsConfig {
    #[serde(default = "default_recommendation_limit")]
    pub default_limit: usize,
}

impl Default for RecommendationsConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_RECOMMENDATION_LIMIT,
        }
    }
}

fn default_recommendation_limit() -> usize {
    DEFAULT_RECOMMENDATION_LIMIT
}

/// Chat model used to pull interests and preferences out of free text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_analysis_model")]
    pub model: String,

    /// Base URL; `/chat/completions` is appended
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_analysis_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_analysis_model(),
            endpoint: default_embedding_endpoint(),
            api_key_env: default_api_key_env(),
            max_tokens: DEFAULT_ANALYSIS_MAX_TOKENS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_analysis_model() -> String {
    DEFAULT_ANALYSIS_MODEL.to_string()
}

fn default_analysis_max_tokens() -> u32 {
    DEFAULT_ANALYSIS_MAX_TOKENS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "task_queue_max_threads")]
    pub task_queue_max_threads: u16,
    #[serde(default = "batch_default_limit")]
    pub batch_default_limit: usize,
    #[serde(default = "listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub recommendations: RecommendationsConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_queue_max_threads: TASK_QUEUE_MAX_THREADS,
            batch_default_limit: BATCH_DEFAULT_LIMIT,
            listen_addr: listen_addr(),
            embeddings: EmbeddingsConfig::default(),
            recommendations: RecommendationsConfig::default(),
            analysis: AnalysisConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn task_queue_max_threads() -> u16 {
    TASK_QUEUE_MAX_THREADS
}

fn batch_default_limit() -> usize {
    BATCH_DEFAULT_LIMIT
}

fn listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl Config {
    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.task_queue_max_threads == 0 {
            self.task_queue_max_threads = 1
        }

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "listen_addr must be a socket address, got '{}'",
                self.listen_addr
            )));
        }

        let emb = &self.embeddings;
        if emb.model.trim().is_empty() {
            return Err(ConfigError::Invalid("embeddings.model must not be empty".to_string()));
        }
        if emb.provider == ProviderKind::Openai && emb.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "embeddings.endpoint must not be empty".to_string(),
            ));
        }
        if emb.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "embeddings.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if emb.max_snapshot_age_secs > MAX_SNAPSHOT_AGE_SECS_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "embeddings.max_snapshot_age_secs must be at most {MAX_SNAPSHOT_AGE_SECS_LIMIT}"
            )));
        }
        if emb.dimensions == Some(0) {
            return Err(ConfigError::Invalid(
                "embeddings.dimensions must be greater than 0".to_string(),
            ));
        }

        let analysis = &self.analysis;
        if analysis.enabled {
            if analysis.model.trim().is_empty() || analysis.endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "analysis.model and analysis.endpoint must not be empty".to_string(),
                ));
            }
            if analysis.timeout_secs == 0 || analysis.max_tokens == 0 {
                return Err(ConfigError::Invalid(
                    "analysis.timeout_secs and analysis.max_tokens must be greater than 0"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base_path = base_path.as_ref();
        let store = BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_snapshot_age(&self) -> chrono::Duration {
        let secs = self.embeddings.max_snapshot_age_secs.min(MAX_SNAPSHOT_AGE_SECS_LIMIT);
        chrono::Duration::seconds(secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.task_queue_max_threads, 4);
        assert_eq!(config.batch_default_limit, 50);
        assert_eq!(config.recommendations.default_limit, 10);
        assert_eq!(config.embeddings.provider, ProviderKind::Openai);
        assert_eq!(config.max_snapshot_age(), chrono::Duration::days(7));
        assert_eq!(config.base_path(), tmp.path());
        assert!(config.analysis.enabled);
        assert_eq!(config.analysis.max_tokens, 1000);
    }

    #[test]
    fn test_fills_missing_keys_and_resaves() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "task_queue_max_threads: 0\nembeddings:\n  provider: fastembed\n  model: bge-small-en-v1.5\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.task_queue_max_threads, 1);
        assert_eq!(config.embeddings.provider, ProviderKind::Fastembed);
        assert_eq!(config.embeddings.model, "bge-small-en-v1.5");
        assert_eq!(config.embeddings.timeout_secs, 30);

        let saved = std::fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("batch_default_limit: 50"));
        assert!(saved.contains("max_snapshot_age_secs"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "embeddings:\n  timeout_secs: 0\n",
        )
        .unwrap();
        assert!(matches!(
            Config::load_with(tmp.path()),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(tmp.path().join(CONFIG_FILE), "listen_addr: nowhere\n").unwrap();
        assert!(matches!(
            Config::load_with(tmp.path()),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(tmp.path().join(CONFIG_FILE), "analysis:\n  max_tokens: 0\n").unwrap();
        assert!(matches!(
            Config::load_with(tmp.path()),
            Err(ConfigError::Invalid(_))
        ));

        // disabled analysis is not checked
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "analysis:\n  enabled: false\n  max_tokens: 0\n",
        )
        .unwrap();
        assert!(Config::load_with(tmp.path()).is_ok());
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "embeddings: [unterminated").unwrap();
        assert!(matches!(
            Config::load_with(tmp.path()),
            Err(ConfigError::Malformed(_))
        ));
    }
}
