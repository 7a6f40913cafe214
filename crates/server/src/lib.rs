//! `playguard` server: configuration, backend selection and the WebSocket
//! front door around the execution engine.

pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod serve;
pub mod ws;

pub use app::App;
pub use config::{IsolationMode, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use serve::{AppState, serve_on};
