//! Everything the supervisor and client need from the outside world, passed
//! in explicitly instead of read from globals.

use std::env;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::media::{Base64Images, ImageConverter};
use crate::resolve::{ModelResolver, ModelsDirectory};

pub const SERVER_PATH_ENV: &str = "LLAMA_SERVER_PATH";
const DEFAULT_SERVER_BINARY: &str = "llama-server";
const DEFAULT_MODELS_DIR: &str = "user_data/models";
const DEFAULT_MMPROJ_DIR: &str = "user_data/mmproj";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// llama-server executable.
    pub server_path: PathBuf,
    /// Fallback directory for a relative `mmproj` name.
    pub mmproj_dir: PathBuf,
    pub model_resolver: Arc<dyn ModelResolver>,
    pub image_converter: Arc<dyn ImageConverter>,
    /// Set by the caller to cut a running stream short.
    pub stop_flag: Arc<AtomicBool>,
    /// Log launch flags and generation payloads.
    pub verbose: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_path: default_server_path(),
            mmproj_dir: PathBuf::from(DEFAULT_MMPROJ_DIR),
            model_resolver: Arc::new(ModelsDirectory::new(DEFAULT_MODELS_DIR)),
            image_converter: Arc::new(Base64Images),
            stop_flag: Arc::new(AtomicBool::new(false)),
            verbose: false,
        }
    }
}

impl ServerOptions {
    pub fn with_server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = path.into();
        self
    }

    pub fn with_mmproj_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mmproj_dir = dir.into();
        self
    }

    pub fn with_model_resolver(mut self, resolver: Arc<dyn ModelResolver>) -> Self {
        self.model_resolver = resolver;
        self
    }

    pub fn with_image_converter(mut self, converter: Arc<dyn ImageConverter>) -> Self {
        self.image_converter = converter;
        self
    }

    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = flag;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// `$LLAMA_SERVER_PATH`, else `llama-server` from `PATH`.
fn default_server_path() -> PathBuf {
    env::var_os(SERVER_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_BINARY))
}
