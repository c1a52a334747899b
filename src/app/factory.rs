use crate::{
    app::local::AppLocal,
    config::Config,
    documents::JsonDocuments,
    semantic::{completer_from_config, provider_from_config},
    storage::{BackendLocal, StorageManager},
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Create a local application instance with its configured provider.
    pub fn create_local_app(paths: &AppPaths) -> Result<AppLocal> {
        let config = Config::load_with(&paths.base_path).context("Failed to load config")?;
        let docs = Self::open_documents(paths)?;

        let provider = provider_from_config(&config.embeddings, &paths.base_path)
            .context("Failed to initialize embedding provider")?;
        log::debug!("using embedding provider {}", provider.name());

        let analysis = config.analysis.clone();
        let app = AppLocal::new(config, Arc::new(docs), provider);

        if !analysis.enabled {
            return Ok(app);
        }
        match completer_from_config(&analysis) {
            Ok(completer) => {
                log::debug!("using analysis model {}", completer.name());
                Ok(app.with_analyzer(completer))
            }
            Err(err) => {
                log::warn!("text analysis disabled: {err}");
                Ok(app)
            }
        }
    }

    /// Open the document store without loading config or a provider.
    pub fn open_documents(paths: &AppPaths) -> Result<JsonDocuments> {
        let storage: Arc<dyn StorageManager> = Arc::new(
            BackendLocal::new(&paths.data_path).context("Failed to create data directory")?,
        );
        JsonDocuments::load(storage).context("Failed to load documents")
    }

    /// Get application paths, creating the base directory if needed
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;
        let data_path = base_path.join("data");

        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths {
            base_path,
            data_path,
        })
    }

    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("VIBEMATCH_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/vibematch"))
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    /// One `<collection>/<id>.json` file per document
    pub data_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let data_path = base_path.join("data");
        Self {
            base_path,
            data_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_paths() {
        let paths = AppPaths::new("/test/base");
        assert_eq!(paths.base_path, PathBuf::from("/test/base"));
        assert_eq!(paths.data_path, PathBuf::from("/test/base/data"));
    }

    #[test]
    fn test_open_documents_creates_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(tmp.path());
        AppFactory::open_documents(&paths).unwrap();
        assert!(paths.data_path.is_dir());
    }
}
