//! Container sandbox backend driven through the `docker` CLI.

mod command;
mod config;
mod factory;
mod prerequisites;
mod sandbox;

pub use config::DockerConfig;
pub use factory::DockerFactory;
pub use sandbox::{DockerSandbox, LABEL_KEY, container_name};
