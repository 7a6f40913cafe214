use std::any::Any;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{OutputLine, ProcessExit};

/// The `Any` bound allows `SandboxFactory::destroy()` to downcast
/// `Box<dyn Sandbox>` back to the concrete type for backend-specific cleanup.
#[async_trait]
pub trait Sandbox: Send + Sync + Any {
    // -- identity --
    fn id(&self) -> &str;
    /// PID of the launched host process, once started.
    fn pid(&self) -> Option<u32>;

    // -- lifecycle --
    /// Launch the artifact. Output lines arrive on the returned channel in the
    /// order they were read; the channel closes once both streams hit EOF.
    async fn start(&mut self) -> Result<mpsc::Receiver<OutputLine>>;
    /// Wait for the process to exit. Must be cancel safe: callers poll it
    /// inside `select!` and may drop the future.
    async fn wait(&mut self) -> Result<ProcessExit>;
    /// Hard kill. Idempotent.
    async fn kill(&mut self) -> Result<()>;
}
