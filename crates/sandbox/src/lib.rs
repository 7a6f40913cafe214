mod config;
mod error;
mod factory;
pub mod process;
mod sandbox;
mod types;

pub use config::{ResourceLimits, SandboxConfig};
pub use error::{Result, SandboxError};
pub use factory::{IsolationLevel, SandboxFactory};
pub use sandbox::Sandbox;
pub use types::{OutputLine, OutputStream, ProcessExit};
