pub mod body;
pub mod config_watcher;
pub mod http_handler;
pub mod middleware;
pub mod script_engine;
pub mod session_store;
pub mod static_files;

/// Re-export commonly used types from adapters
pub use config_watcher::{ConfigWatcher, ReloadOutcome};
pub use http_handler::{HttpHandler, build_router};
pub use middleware::*;
pub use script_engine::RhaiScriptEngine;
pub use session_store::{SessionTicket, SessionTracker};
pub use static_files::StaticFileAdapter;
