//! Atrium - a multi-application web host with hot-reloadable routing.
//!
//! Atrium hosts any number of web applications side by side, each mounted at
//! its own context path. An application is described by one or more JSON
//! definition files in its directory under the webapps root; those files bind
//! URL patterns to static directories, compiled controllers and Rhai scripts.
//! Editing, adding or deleting a definition file takes effect without a
//! restart, and in-flight requests finish against the context they started on.
//!
//! # Features
//! - Context-path routing with first-match glob or regex patterns and `$N` targets
//! - Static files with `Last-Modified`, conditional and range requests
//! - Compiled controllers, filters, listeners and identity managers
//! - Sandboxed Rhai controllers with request, response, session and tool bindings
//! - Form, multipart, JSON, XML, text and binary request bodies
//! - Sessions that follow a user across context rebuilds
//! - Structured error pages in HTML, JSON or XML
//! - Live definition reload via `notify`, structured tracing and `metrics` counters
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use atrium::{
//!     ConfigWatcher, HttpHandler, RhaiScriptEngine, RoutingEngine, SessionTracker,
//!     adapters::build_router, config::ServerConfig,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(atrium::config::load_config("config.toml").await?);
//! let scripts = Arc::new(RhaiScriptEngine::new(&config.scripts));
//! let engine = Arc::new(RoutingEngine::builder(config.clone(), scripts).build());
//!
//! ConfigWatcher::from_config(&config, engine.clone()).scan()?;
//! engine.warm_up()?;
//!
//! let sessions = Arc::new(SessionTracker::new(&config.session));
//! let app = build_router(Arc::new(HttpHandler::new(engine, sessions)));
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping routing logic inside `core`. The core never touches the
//! network or the file watcher; it is driven through
//! [`DefinitionSink`](ports::definition_sink::DefinitionSink) and the
//! [`RoutingEngine`] methods.
//!
//! # Error Handling
//! Startup and wiring APIs return `eyre::Result<T>`. Request-time failures are
//! typed ([`core::controller::ControllerFault`], [`core::error::RouteError`])
//! and always end up as an error response, never as a dropped connection.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; the definition snapshot is swapped with
//! `arc-swap` so readers never block on a reload.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{ConfigWatcher, HttpHandler, RhaiScriptEngine, SessionTracker, StaticFileAdapter},
    core::{DefinitionStore, RoutingEngine, WebappDefinition},
    utils::GracefulShutdown,
};
