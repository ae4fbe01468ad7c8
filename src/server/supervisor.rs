//! Brings a llama-server up: port, spawn, health gate, startup metadata.

use std::net::Ipv4Addr;
use std::path::Path;
use std::thread;
use std::time::Duration;

use llama_server_types::ServerConfig;
use log::{debug, info, warn};
use serde_json::Value;

use super::command::build_launch_command;
use super::process::ServerProcess;
use crate::error::{Result, ServerError};
use crate::options::ServerOptions;
use crate::port::find_available_port;

pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BOS_TOKEN: &str = "<s>";

/// Loopback address of one server's HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEndpoint {
    host: Ipv4Addr,
    port: u16,
}

impl ServerEndpoint {
    pub fn loopback(port: u16) -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{path}", self.host, self.port)
    }
}

/// Model facts read once after the health gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMetadata {
    pub vocabulary_size: Option<u64>,
    pub bos_token: String,
}

impl Default for ServerMetadata {
    fn default() -> Self {
        Self {
            vocabulary_size: None,
            bos_token: DEFAULT_BOS_TOKEN.to_string(),
        }
    }
}

/// A running, health-checked server.
#[derive(Debug)]
pub struct ServerSupervisor {
    endpoint: ServerEndpoint,
    metadata: ServerMetadata,
    process: ServerProcess,
}

impl ServerSupervisor {
    /// Launch `model_path` and block until `/health` answers 200.
    ///
    /// Fails fast if the process exits first; otherwise polls forever.
    pub fn start(
        model_path: &Path,
        config: &ServerConfig,
        options: &ServerOptions,
        agent: &ureq::Agent,
    ) -> Result<Self> {
        let port = find_available_port()?;
        let endpoint = ServerEndpoint::loopback(port);
        let launch = build_launch_command(model_path, port, config, options)?;

        if options.verbose {
            info!("[SERVER] llama-server command-line flags:\n{}", launch.args_display());
        }
        info!(
            "[SERVER] Using gpu_layers={} | ctx_size={} | cache_type={}",
            config.gpu_layers, config.ctx_size, launch.cache_type
        );

        let mut process = ServerProcess::spawn(&launch)?;
        // On error `process` is dropped here, which stops it
        wait_until_healthy(agent, &endpoint, HEALTH_POLL_INTERVAL, || {
            process.exit_status().map(|s| s.code())
        })?;
        info!("[SERVER] llama-server ready on port {port}");

        let metadata = fetch_metadata(agent, &endpoint);
        debug!(
            "[SERVER] n_vocab={:?} bos_token={:?}",
            metadata.vocabulary_size, metadata.bos_token
        );

        Ok(Self {
            endpoint,
            metadata,
            process,
        })
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        self.endpoint
    }

    pub fn metadata(&self) -> &ServerMetadata {
        &self.metadata
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    pub fn stop(&mut self) {
        self.process.stop();
    }
}

/// Poll `/health` every `interval` until it returns 200.
///
/// `exited` is checked before each probe and returns the exit code (`None`
/// inside when killed by a signal) once the process is gone. Connection
/// errors and non-200 answers just mean "not ready yet".
pub fn wait_until_healthy<F>(
    agent: &ureq::Agent,
    endpoint: &ServerEndpoint,
    interval: Duration,
    mut exited: F,
) -> Result<()>
where
    F: FnMut() -> Option<Option<i32>>,
{
    let url = endpoint.url("/health");
    loop {
        if let Some(code) = exited() {
            return Err(ServerError::ExitedDuringStartup { code });
        }

        match agent.get(&url).timeout(HEALTH_REQUEST_TIMEOUT).call() {
            Ok(response) if response.status() == 200 => return Ok(()),
            Ok(response) => debug!("[SERVER] /health returned {}", response.status()),
            Err(ureq::Error::Status(code, _)) => debug!("[SERVER] /health returned {code}"),
            Err(_) => {}
        }

        thread::sleep(interval);
    }
}

/// Read vocabulary size and BOS token. Missing fields or failed requests
/// keep the defaults.
pub fn fetch_metadata(agent: &ureq::Agent, endpoint: &ServerEndpoint) -> ServerMetadata {
    let mut metadata = ServerMetadata::default();

    if let Some(models) = get_json(agent, &endpoint.url("/v1/models")) {
        metadata.vocabulary_size = models
            .pointer("/data/0/meta/n_vocab")
            .and_then(Value::as_u64);
    }

    if let Some(props) = get_json(agent, &endpoint.url("/props")) {
        if let Some(bos) = props.get("bos_token").and_then(Value::as_str) {
            metadata.bos_token = bos.to_string();
        }
    }

    metadata
}

fn get_json(agent: &ureq::Agent, url: &str) -> Option<Value> {
    let response = agent
        .get(url)
        .timeout(METADATA_REQUEST_TIMEOUT)
        .call()
        .map_err(|e| warn!("[SERVER] GET {url} failed: {e}"))
        .ok()?;
    response
        .into_json::<Value>()
        .map_err(|e| warn!("[SERVER] Invalid JSON from {url}: {e}"))
        .ok()
}
