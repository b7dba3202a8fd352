//! The routing engine: single owner of every routing subsystem.
//!
//! Built once at startup and shared by reference with the transport layer
//! and the definition watcher. There is no global state; two engines in one
//! process are fully independent.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::models::ServerConfig,
    core::{
        application::{ContextError, ContextFactory},
        controller::ControllerRegistry,
        definition::WebappDefinition,
        definitions::{DefinitionSource, DefinitionStore},
        invoker::ControllerInvoker,
        registry::ApplicationRegistry,
        tools::ToolRegistry,
    },
    ports::{definition_sink::DefinitionSink, script_engine::ScriptEngine},
};

pub struct RoutingEngine {
    config: Arc<ServerConfig>,
    definitions: Arc<DefinitionStore>,
    registry: Arc<ApplicationRegistry>,
    invoker: ControllerInvoker,
    tools: Arc<ToolRegistry>,
}

impl RoutingEngine {
    pub fn builder(config: Arc<ServerConfig>, scripts: Arc<dyn ScriptEngine>) -> RoutingEngineBuilder {
        RoutingEngineBuilder {
            config,
            scripts,
            controllers: ControllerRegistry::with_builtins(),
            tools: None,
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.definitions
    }

    pub fn registry(&self) -> &Arc<ApplicationRegistry> {
        &self.registry
    }

    pub fn invoker(&self) -> &ControllerInvoker {
        &self.invoker
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Build a context for every loaded application. Any failure here is a
    /// startup misconfiguration.
    pub fn warm_up(&self) -> Result<(), ContextError> {
        match self.registry.refresh().into_iter().next() {
            Some(error) => Err(error),
            None => {
                tracing::info!(
                    applications = self.definitions.snapshot().len(),
                    "Routing engine ready"
                );
                Ok(())
            }
        }
    }

    /// Transport-side notification that a session id expired.
    pub async fn on_session_expired(&self, id: &str) -> usize {
        self.registry.invalidate_session(id).await
    }

    fn publish(&self) {
        for error in self.registry.refresh() {
            tracing::error!(error = %error, "Application context rejected after reload");
        }
    }
}

impl DefinitionSink for RoutingEngine {
    fn load(&self, source: DefinitionSource, definition: WebappDefinition) {
        self.definitions.load(source, definition);
        self.publish();
    }

    fn unload(&self, file: &Path) {
        self.definitions.unload(file);
        self.publish();
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        self.definitions.tracked_files()
    }
}

pub struct RoutingEngineBuilder {
    config: Arc<ServerConfig>,
    scripts: Arc<dyn ScriptEngine>,
    controllers: ControllerRegistry,
    tools: Option<ToolRegistry>,
}

impl RoutingEngineBuilder {
    /// Replace the controller registry (built-ins included by default).
    pub fn controllers(mut self, controllers: ControllerRegistry) -> Self {
        self.controllers = controllers;
        self
    }

    /// Access the controller registry to register additional factories.
    pub fn controllers_mut(&mut self) -> &mut ControllerRegistry {
        &mut self.controllers
    }

    /// Replace the tool registry (defaults to the `[tools]` configuration section).
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn build(self) -> RoutingEngine {
        let tools = Arc::new(
            self.tools
                .unwrap_or_else(|| ToolRegistry::from_config(&self.config.tools)),
        );
        let definitions = Arc::new(DefinitionStore::new());
        let factory = ContextFactory::new(
            Arc::new(self.controllers),
            tools.clone(),
            self.config.scripts.extension.clone(),
        );
        let registry = Arc::new(ApplicationRegistry::new(definitions.clone(), factory));

        RoutingEngine {
            config: self.config,
            definitions,
            registry,
            invoker: ControllerInvoker::new(self.scripts),
            tools,
        }
    }
}
