use std::{path::Path, sync::Arc};

use thiserror::Error;

use crate::core::{
    controller::{ConsoleSink, ControllerRequest, DocumentReader, ResponseHandle},
    session::SessionRecord,
    tools::ToolRegistry,
};

/// Subsystem a script failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    Script,
    /// Template or document access through the `files` binding
    View,
    /// A call through the `tools` binding
    Query,
    /// Request body access
    Body,
}

/// Error type for script evaluation
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ScriptError {
    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("Failed to read script {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to compile script {path}: {message}")]
    Compile { path: String, message: String },

    #[error("Script {path} failed: {message}")]
    Runtime {
        path: String,
        origin: FaultOrigin,
        message: String,
    },
}

/// The complete set of capabilities handed to a script.
///
/// Nothing outside these bindings is reachable from script code.
#[derive(Clone)]
pub struct ScriptBindings {
    pub request: Arc<ControllerRequest>,
    pub response: ResponseHandle,
    pub session: Arc<SessionRecord>,
    pub tools: Arc<ToolRegistry>,
    pub files: DocumentReader,
    pub console: ConsoleSink,
    /// User named by the application's identity manager
    pub user: Option<String>,
}

/// ScriptEngine defines the port for evaluating interpreted controllers.
///
/// Evaluation is synchronous and may block; callers run it off the async
/// executor and never while holding a shared lock.
pub trait ScriptEngine: Send + Sync + 'static {
    fn evaluate(&self, script: &Path, bindings: ScriptBindings) -> Result<(), ScriptError>;
}
