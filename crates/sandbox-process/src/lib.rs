//! Direct child-process sandbox backend.
//!
//! Used only when no container runtime is available. Scripts run as plain
//! host processes with the same timeout but none of the filesystem, network
//! or capability restrictions of the container backend.

mod config;
mod factory;
mod sandbox;

pub use config::ProcessConfig;
pub use factory::ProcessFactory;
pub use sandbox::ProcessSandbox;
