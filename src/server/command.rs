//! Translates a `ServerConfig` into a llama-server command line.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use llama_server_types::{ServerConfig, VALID_CACHE_TYPES};
use log::warn;

use crate::error::Result;
use crate::options::ServerOptions;
use crate::resolve::resolve_model_file;

const DEFAULT_CACHE_TYPE: &str = "fp16";

/// A fully resolved launch: program, arguments and environment tweaks.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// KV cache type actually passed (after allow-list fallback).
    pub cache_type: String,
    /// Replacement `LD_LIBRARY_PATH`, when one is needed.
    pub library_path: Option<OsString>,
}

impl LaunchCommand {
    /// A `Command` with stderr piped for the log filter.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(path) = &self.library_path {
            cmd.env("LD_LIBRARY_PATH", path);
        }
        cmd
    }

    /// Arguments joined with spaces, for logging.
    pub fn args_display(&self) -> String {
        self.args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build the launch for `model_path` on `port`.
///
/// Fails only when a configured draft model has no `.gguf` file.
pub fn build_launch_command(
    model_path: &Path,
    port: u16,
    config: &ServerConfig,
    options: &ServerOptions,
) -> Result<LaunchCommand> {
    let mut args = ArgList::default();

    args.opt("--model", model_path);
    args.opt("--ctx-size", config.ctx_size.to_string());
    args.opt("--gpu-layers", config.gpu_layers.to_string());
    args.opt("--batch-size", config.batch_size.to_string());
    args.opt("--port", port.to_string());
    args.flag("--no-webui");
    args.opt("--flash-attn", "on");

    if config.threads > 0 {
        args.opt("--threads", config.threads.to_string());
    }
    if config.threads_batch > 0 {
        args.opt("--threads-batch", config.threads_batch.to_string());
    }
    if config.no_mmap {
        args.flag("--no-mmap");
    }
    if config.mlock {
        args.flag("--mlock");
    }
    if let Some(split) = config.tensor_split.as_deref().filter(|s| !s.is_empty()) {
        args.opt("--tensor-split", split);
    }
    if config.numa {
        args.opt("--numa", "distribute");
    }
    if config.no_kv_offload {
        args.flag("--no-kv-offload");
    }
    if config.row_split {
        args.opt("--split-mode", "row");
    }

    let cache_type = effective_cache_type(&config.cache_type);
    if cache_type != DEFAULT_CACHE_TYPE {
        args.opt("--cache-type-k", cache_type);
        args.opt("--cache-type-v", cache_type);
    }

    if config.compress_pos_emb != 1.0 && config.compress_pos_emb > 0.0 {
        args.opt("--rope-freq-scale", (1.0 / config.compress_pos_emb).to_string());
    }
    if config.rope_freq_base > 0.0 {
        args.opt("--rope-freq-base", config.rope_freq_base.to_string());
    }

    if config.is_multimodal() {
        if let Some(mmproj) = config.mmproj.as_deref() {
            match resolve_mmproj(mmproj, &options.mmproj_dir) {
                Some(path) => args.opt("--mmproj", path),
                None => warn!("[SERVER] mmproj file not found: {mmproj}"),
            }
        }
    }

    if let Some(draft) = config.model_draft.as_deref().filter(|d| !d.is_empty() && *d != "None") {
        let model_file = resolve_model_file(&options.model_resolver.resolve(draft))?;
        args.opt("--model-draft", model_file);
        if config.draft_max > 0 {
            args.opt("--draft-max", config.draft_max.to_string());
        }
        if config.gpu_layers_draft > 0 {
            args.opt("--gpu-layers-draft", config.gpu_layers_draft.to_string());
        }
        if let Some(device) = config.device_draft.as_deref().filter(|d| !d.is_empty()) {
            args.opt("--device-draft", device);
        }
        if config.ctx_size_draft > 0 {
            args.opt("--ctx-size-draft", config.ctx_size_draft.to_string());
        }
    }

    if config.streaming_llm {
        args.opt("--cache-reuse", "1");
        args.flag("--swa-full");
    }

    if let Some(extra) = config.extra_flags.as_deref() {
        for arg in parse_extra_flags(extra) {
            args.push(arg);
        }
    }

    Ok(LaunchCommand {
        program: options.server_path.clone(),
        args: args.into_inner(),
        cache_type: cache_type.to_string(),
        library_path: library_path_for(&options.server_path),
    })
}

/// Unknown cache types silently fall back to fp16.
pub fn effective_cache_type(requested: &str) -> &str {
    if VALID_CACHE_TYPES.contains(&requested) {
        requested
    } else {
        DEFAULT_CACHE_TYPE
    }
}

fn resolve_mmproj(mmproj: &str, fallback_dir: &Path) -> Option<PathBuf> {
    let literal = PathBuf::from(mmproj);
    if literal.exists() {
        return Some(literal);
    }
    let fallback = fallback_dir.join(mmproj);
    fallback.exists().then_some(fallback)
}

/// Split `"ngl=10,no-perf,ctx-size=4096"` into server arguments.
///
/// Surrounding quotes are stripped. Names of three characters or fewer get a
/// single dash, longer ones two.
pub fn parse_extra_flags(raw: &str) -> Vec<String> {
    let mut flags = raw.trim();
    for quote in ['"', '\''] {
        if flags.len() >= 2 && flags.starts_with(quote) && flags.ends_with(quote) {
            flags = flags[1..flags.len() - 1].trim();
            break;
        }
    }

    let mut out = Vec::new();
    for item in flags.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('=') {
            Some((name, value)) => {
                out.push(dashed(name));
                out.push(value.to_string());
            }
            None => out.push(dashed(item)),
        }
    }
    out
}

fn dashed(name: &str) -> String {
    if name.chars().count() <= 3 {
        format!("-{name}")
    } else {
        format!("--{name}")
    }
}

/// On POSIX the server's own directory is appended to `LD_LIBRARY_PATH` so
/// bundled shared libraries are found.
#[cfg(unix)]
fn library_path_for(server_path: &Path) -> Option<OsString> {
    let dir = server_path.parent().filter(|d| !d.as_os_str().is_empty())?;
    match std::env::var_os("LD_LIBRARY_PATH").filter(|p| !p.is_empty()) {
        Some(current) => {
            let mut joined = current;
            joined.push(":");
            joined.push(dir.as_os_str());
            Some(joined)
        }
        None => Some(dir.as_os_str().to_os_string()),
    }
}

#[cfg(not(unix))]
fn library_path_for(_server_path: &Path) -> Option<OsString> {
    None
}

#[derive(Default)]
struct ArgList(Vec<OsString>);

impl ArgList {
    fn flag(&mut self, name: &str) {
        self.0.push(name.into());
    }

    fn opt(&mut self, name: &str, value: impl AsRef<OsStr>) {
        self.0.push(name.into());
        self.0.push(value.as_ref().to_os_string());
    }

    fn push(&mut self, arg: impl Into<OsString>) {
        self.0.push(arg.into());
    }

    fn into_inner(self) -> Vec<OsString> {
        self.0
    }
}
