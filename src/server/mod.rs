//! llama-server process supervision.

pub mod command;
pub mod process;
pub mod supervisor;

pub use command::{build_launch_command, LaunchCommand};
pub use process::ServerProcess;
pub use supervisor::{ServerEndpoint, ServerMetadata, ServerSupervisor};
