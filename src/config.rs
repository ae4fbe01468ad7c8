//! JSON settings file for the CLI and embedders.
//!
//! Every section is optional; missing fields take the same defaults as the
//! records themselves.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_server_types::{GenerationState, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::options::{ServerOptions, SERVER_PATH_ENV};
use crate::resolve::ModelsDirectory;

pub const MODELS_DIR_ENV: &str = "LLAMA_MODELS_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub generation: GenerationState,
    #[serde(default)]
    pub server_path: Option<PathBuf>,
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    #[serde(default)]
    pub mmproj_dir: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
    /// Also write logs to a timestamped file in this directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_error = |message: String| ServerError::Config {
            path: path.to_path_buf(),
            message,
        };
        let text = fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| config_error(e.to_string()))
    }

    /// Apply `LLAMA_SERVER_PATH` and `LLAMA_MODELS_DIR` from the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var_os(key))
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        if let Some(path) = non_empty(SERVER_PATH_ENV) {
            self.server_path = Some(path);
        }
        if let Some(dir) = non_empty(MODELS_DIR_ENV) {
            self.models_dir = Some(dir);
        }
        self
    }

    pub fn server_options(&self) -> ServerOptions {
        let mut options = ServerOptions::default().with_verbose(self.verbose);
        if let Some(path) = &self.server_path {
            options = options.with_server_path(path);
        }
        if let Some(dir) = &self.mmproj_dir {
            options = options.with_mmproj_dir(dir);
        }
        if let Some(dir) = &self.models_dir {
            options = options.with_model_resolver(Arc::new(ModelsDirectory::new(dir)));
        }
        options
    }
}
