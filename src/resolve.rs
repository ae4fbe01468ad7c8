//! Model-name to file resolution.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};

/// Maps a model name as typed by the user to a path on disk. The path may be
/// a single file or a directory holding `.gguf` files.
pub trait ModelResolver: fmt::Debug + Send + Sync {
    fn resolve(&self, name: &str) -> PathBuf;
}

/// Resolves names relative to a models directory unless the name is already
/// an existing path.
#[derive(Debug, Clone)]
pub struct ModelsDirectory {
    root: PathBuf,
}

impl ModelsDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModelResolver for ModelsDirectory {
    fn resolve(&self, name: &str) -> PathBuf {
        let literal = Path::new(name);
        if literal.exists() {
            literal.to_path_buf()
        } else {
            self.root.join(name)
        }
    }
}

/// Pick the concrete `.gguf` for a resolved model path: the path itself when
/// it is a file, otherwise the lexicographically first `.gguf` inside it.
pub fn resolve_model_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    let not_found = || ServerError::ModelFileNotFound {
        path: path.to_path_buf(),
    };

    let mut candidates: Vec<PathBuf> = fs::read_dir(path)
        .map_err(|_| not_found())?
        .filter_map(|entry| entry.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "gguf").unwrap_or(false))
        .collect();
    candidates.sort();

    candidates.into_iter().next().ok_or_else(not_found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_literal_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("draft.gguf");
        File::create(&model).unwrap();

        let resolver = ModelsDirectory::new("/does/not/exist");
        assert_eq!(resolver.resolve(model.to_str().unwrap()), model);
    }

    #[test]
    fn test_name_joins_models_dir() {
        let resolver = ModelsDirectory::new("user_data/models");
        assert_eq!(
            resolver.resolve("qwen-0.5b"),
            PathBuf::from("user_data/models/qwen-0.5b")
        );
    }

    #[test]
    fn test_directory_picks_first_sorted_gguf() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("b-Q8_0.gguf")).unwrap();
        File::create(dir.path().join("a-Q4_K_M.gguf")).unwrap();
        File::create(dir.path().join("README.md")).unwrap();

        let picked = resolve_model_file(dir.path()).unwrap();
        assert_eq!(picked, dir.path().join("a-Q4_K_M.gguf"));
    }

    #[test]
    fn test_file_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("z.gguf");
        File::create(&file).unwrap();
        File::create(dir.path().join("a.gguf")).unwrap();

        assert_eq!(resolve_model_file(&file).unwrap(), file);
    }

    #[test]
    fn test_missing_gguf_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let err = resolve_model_file(dir.path()).unwrap_err();
        assert!(matches!(err, ServerError::ModelFileNotFound { .. }));

        let err = resolve_model_file(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, ServerError::ModelFileNotFound { .. }));
    }
}
