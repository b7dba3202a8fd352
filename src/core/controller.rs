//! Controller contracts and the per-request objects handed to them.
//!
//! Compiled controllers, filters, listeners and identity providers are
//! registered by name in a [`ControllerRegistry`] and instantiated once per
//! route registration, never per request. Every instance receives the shared
//! [`ToolRegistry`] at construction.
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri,
    header::{CONTENT_TYPE, LOCATION},
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::{
    core::{
        error::ErrorTitle,
        file_path::{FilePath, join_confined},
        session::SessionRecord,
        tools::{ToolError, ToolRegistry},
    },
    ports::script_engine::{FaultOrigin, ScriptBindings, ScriptError},
};

/// A failure raised while a controller (or filter) handles a request.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ControllerFault {
    #[error("Script failed: {0}")]
    Script(String),

    #[error("View failed: {0}")]
    View(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Unsupported request body: {0}")]
    Body(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Handler failed: {0}")]
    Handler(#[from] eyre::Report),
}

impl ControllerFault {
    pub fn title(&self) -> ErrorTitle {
        match self {
            ControllerFault::Script(_) => ErrorTitle::ScriptError,
            ControllerFault::View(_) => ErrorTitle::ViewError,
            ControllerFault::Query(_) => ErrorTitle::QueryError,
            ControllerFault::Body(_) => ErrorTitle::BodyError,
            ControllerFault::NotFound(_) => ErrorTitle::NotFoundError,
            ControllerFault::Handler(_) => ErrorTitle::Error,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ControllerFault::Body(_) => StatusCode::NOT_ACCEPTABLE,
            ControllerFault::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ScriptError> for ControllerFault {
    fn from(error: ScriptError) -> Self {
        match error {
            ScriptError::NotFound(path) => ControllerFault::NotFound(path),
            ScriptError::Runtime {
                origin: FaultOrigin::View,
                ..
            } => ControllerFault::View(error.to_string()),
            ScriptError::Runtime {
                origin: FaultOrigin::Query,
                ..
            } => ControllerFault::Query(error.to_string()),
            ScriptError::Runtime {
                origin: FaultOrigin::Body,
                ..
            } => ControllerFault::Body(error.to_string()),
            other => ControllerFault::Script(other.to_string()),
        }
    }
}

impl From<ToolError> for ControllerFault {
    fn from(error: ToolError) -> Self {
        ControllerFault::Query(error.to_string())
    }
}

/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// A request body parsed according to its `Content-Type`.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Form(Vec<(String, String)>),
    Multipart(Vec<MultipartPart>),
    Xml(xmltree::Element),
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl RequestBody {
    /// JSON view of the body, as exposed to scripts.
    pub fn to_value(&self) -> Value {
        match self {
            RequestBody::Empty => Value::Null,
            RequestBody::Form(fields) => {
                let map: Map<String, Value> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                Value::Object(map)
            }
            RequestBody::Multipart(parts) => Value::Array(
                parts
                    .iter()
                    .map(|part| {
                        json!({
                            "name": part.name,
                            "file_name": part.file_name,
                            "content_type": part.content_type,
                            "size": part.data.len(),
                            "text": std::str::from_utf8(&part.data).ok(),
                        })
                    })
                    .collect(),
            ),
            RequestBody::Xml(element) => xml_to_value(element),
            RequestBody::Json(value) => value.clone(),
            RequestBody::Text(text) => Value::String(text.clone()),
            RequestBody::Binary(bytes) => json!({ "size": bytes.len() }),
        }
    }
}

/// `{name, attributes, text, children}` tree for an XML element.
pub fn xml_to_value(element: &xmltree::Element) -> Value {
    let attributes: Map<String, Value> = element
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let children: Vec<Value> = element
        .children
        .iter()
        .filter_map(|node| node.as_element().map(xml_to_value))
        .collect();
    json!({
        "name": element.name,
        "attributes": attributes,
        "text": element.get_text().map(|t| t.trim().to_string()),
        "children": children,
    })
}

/// Request as seen by controllers. Immutable once built.
#[derive(Debug, Clone)]
pub struct ControllerRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub path: FilePath,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub remote_addr: Option<SocketAddr>,
}

impl ControllerRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, path: FilePath) -> Self {
        let query = uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self {
            method,
            uri,
            headers,
            path,
            query,
            body: RequestBody::Empty,
            remote_addr: None,
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Query parameter, falling back to a form field of the body.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query_param(name).or_else(|| match &self.body {
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        })
    }
}

/// Response under construction by a controller.
#[derive(Debug, Clone)]
pub struct ControllerResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Default for ControllerResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }
}

impl ControllerResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), ControllerFault> {
        let name = HeaderName::try_from(name)
            .map_err(|e| eyre::eyre!("Invalid header name '{name}': {e}"))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| eyre::eyre!("Invalid value for header '{name}': {e}"))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn set_content_type(&mut self, content_type: &str) -> Result<(), ControllerFault> {
        self.set_header(CONTENT_TYPE.as_str(), content_type)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    /// Replace the body with `value` serialized as JSON.
    pub fn json(&mut self, value: &Value) -> Result<(), ControllerFault> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| eyre::eyre!("Failed to serialize JSON response: {e}"))?;
        self.set_content_type("application/json")?;
        self.body = bytes;
        Ok(())
    }

    pub fn redirect(&mut self, location: &str) -> Result<(), ControllerFault> {
        self.set_header(LOCATION.as_str(), location)?;
        self.status = StatusCode::FOUND;
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Vec<u8>) {
        (self.status, self.headers, self.body)
    }
}

/// Shared handle to the response of one transaction.
#[derive(Debug, Clone, Default)]
pub struct ResponseHandle(Arc<Mutex<ControllerResponse>>);

impl ResponseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ControllerResponse> {
        self.0.lock()
    }

    /// Move the response out, leaving a fresh default behind.
    pub fn take(&self) -> ControllerResponse {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Read-only access to files under an application's document root.
#[derive(Debug, Clone)]
pub struct DocumentReader {
    root: PathBuf,
}

impl DocumentReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn locate(&self, relative: &str) -> Result<PathBuf, ControllerFault> {
        join_confined(&self.root, relative)
            .ok_or_else(|| ControllerFault::View(format!("'{relative}' is outside the document root")))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.locate(relative).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Blocking read; meant for script evaluation which already runs off the executor.
    pub fn read_to_string(&self, relative: &str) -> Result<String, ControllerFault> {
        let path = self.locate(relative)?;
        std::fs::read_to_string(&path)
            .map_err(|e| ControllerFault::View(format!("Cannot read '{relative}': {e}")))
    }
}

/// Log sink for controller output, tagged with the owning application.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    context_path: Arc<str>,
}

impl ConsoleSink {
    pub fn new(context_path: &str) -> Self {
        Self {
            context_path: Arc::from(context_path),
        }
    }

    pub fn log(&self, message: &str) {
        tracing::info!(target: "atrium::script", context_path = %self.context_path, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(target: "atrium::script", context_path = %self.context_path, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(target: "atrium::script", context_path = %self.context_path, "{message}");
    }
}

/// Everything one controller invocation may touch.
#[derive(Clone)]
pub struct ControllerContext {
    pub request: Arc<ControllerRequest>,
    pub response: ResponseHandle,
    pub session: Arc<SessionRecord>,
    pub tools: Arc<ToolRegistry>,
    pub documents: DocumentReader,
    pub console: ConsoleSink,
    pub identity: Option<Arc<dyn IdentityProvider>>,
}

impl ControllerContext {
    /// The capability set exposed to interpreted controllers.
    pub fn script_bindings(&self) -> ScriptBindings {
        ScriptBindings {
            request: self.request.clone(),
            response: self.response.clone(),
            session: self.session.clone(),
            tools: self.tools.clone(),
            files: self.documents.clone(),
            console: self.console.clone(),
            user: self.user(),
        }
    }

    /// User resolved by the application's identity manager, if one is configured.
    pub fn user(&self) -> Option<String> {
        self.identity
            .as_ref()
            .and_then(|provider| provider.current_user(&self.request, &self.session))
    }
}

#[async_trait]
pub trait Controller: Send + Sync {
    /// Whether this controller serves `method` on `path`; consulted by composites.
    fn accepts(&self, _method: &Method, _path: &FilePath) -> bool {
        true
    }

    async fn handle(&self, ctx: &ControllerContext) -> Result<(), ControllerFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Continue,
    /// Stop the chain; the response written so far is sent as is
    Halt,
}

#[async_trait]
pub trait Filter: Send + Sync {
    async fn apply(&self, ctx: &ControllerContext) -> Result<FilterAction, ControllerFault>;
}

/// Notified when an application context is published and when it is drained.
pub trait ContextListener: Send + Sync {
    fn context_initialized(&self, _context_path: &str) {}
    fn context_destroyed(&self, _context_path: &str) {}
}

pub trait IdentityProvider: Send + Sync {
    fn current_user(&self, request: &ControllerRequest, session: &SessionRecord) -> Option<String>;
}

/// Built-in `Health` controller.
pub struct HealthController;

#[async_trait]
impl Controller for HealthController {
    async fn handle(&self, ctx: &ControllerContext) -> Result<(), ControllerFault> {
        ctx.response.lock().json(&json!({ "status": "ok" }))
    }
}

/// Built-in `SessionAttribute` identity provider: the `user` session attribute.
pub struct SessionAttributeIdentity;

impl IdentityProvider for SessionAttributeIdentity {
    fn current_user(&self, _request: &ControllerRequest, session: &SessionRecord) -> Option<String> {
        session
            .get_attribute("user")
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

/// Several named controllers served under one route; the first one accepting
/// the request handles it.
pub struct CompositeController {
    members: Vec<(String, Arc<dyn Controller>)>,
}

impl CompositeController {
    pub fn new(members: Vec<(String, Arc<dyn Controller>)>) -> Self {
        Self { members }
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[async_trait]
impl Controller for CompositeController {
    fn accepts(&self, method: &Method, path: &FilePath) -> bool {
        self.members.iter().any(|(_, c)| c.accepts(method, path))
    }

    async fn handle(&self, ctx: &ControllerContext) -> Result<(), ControllerFault> {
        let request = &ctx.request;
        match self
            .members
            .iter()
            .find(|(_, c)| c.accepts(&request.method, &request.path))
        {
            Some((_, controller)) => controller.handle(ctx).await,
            None => Err(ControllerFault::NotFound(request.path.raw_path.clone())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Unknown controller '{0}'")]
    UnknownController(String),

    #[error("Unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("Unknown listener '{0}'")]
    UnknownListener(String),

    #[error("Unknown identity provider '{0}'")]
    UnknownIdentityProvider(String),

    #[error("Empty controller specification")]
    EmptySpec,
}

type Factory<T> = Arc<dyn Fn(&Arc<ToolRegistry>) -> Arc<T> + Send + Sync>;

/// Identifier → constructor tables for everything a definition can name.
#[derive(Clone, Default)]
pub struct ControllerRegistry {
    controllers: HashMap<String, Factory<dyn Controller>>,
    filters: HashMap<String, Factory<dyn Filter>>,
    listeners: HashMap<String, Factory<dyn ContextListener>>,
    identity_providers: HashMap<String, Factory<dyn IdentityProvider>>,
}

impl fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("controllers", &self.controllers.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .field(
                "identity_providers",
                &self.identity_providers.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in `Health` controller and
    /// `SessionAttribute` identity provider.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_controller("Health", |_| Arc::new(HealthController));
        registry.register_identity_provider("SessionAttribute", |_| {
            Arc::new(SessionAttributeIdentity)
        });
        registry
    }

    pub fn register_controller<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Arc<ToolRegistry>) -> Arc<dyn Controller> + Send + Sync + 'static,
    {
        self.controllers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Arc<ToolRegistry>) -> Arc<dyn Filter> + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_listener<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Arc<ToolRegistry>) -> Arc<dyn ContextListener> + Send + Sync + 'static,
    {
        self.listeners.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_identity_provider<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Arc<ToolRegistry>) -> Arc<dyn IdentityProvider> + Send + Sync + 'static,
    {
        self.identity_providers.insert(name.into(), Arc::new(factory));
        self
    }

    /// Instantiate the controller named by `spec`. A list of names separated by
    /// spaces or commas builds a [`CompositeController`].
    pub fn build_controller(
        &self,
        spec: &str,
        tools: &Arc<ToolRegistry>,
    ) -> Result<Arc<dyn Controller>, RegistryError> {
        let names: Vec<&str> = spec
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|name| !name.is_empty())
            .collect();

        let mut members = Vec::with_capacity(names.len());
        for name in &names {
            let factory = self
                .controllers
                .get(*name)
                .ok_or_else(|| RegistryError::UnknownController(name.to_string()))?;
            members.push((name.to_string(), factory(tools)));
        }

        match members.len() {
            0 => Err(RegistryError::EmptySpec),
            1 => Ok(members.remove(0).1),
            _ => Ok(Arc::new(CompositeController::new(members))),
        }
    }

    pub fn build_filter(
        &self,
        name: &str,
        tools: &Arc<ToolRegistry>,
    ) -> Result<Arc<dyn Filter>, RegistryError> {
        self.filters
            .get(name.trim())
            .map(|factory| factory(tools))
            .ok_or_else(|| RegistryError::UnknownFilter(name.to_string()))
    }

    pub fn build_listener(
        &self,
        name: &str,
        tools: &Arc<ToolRegistry>,
    ) -> Result<Arc<dyn ContextListener>, RegistryError> {
        self.listeners
            .get(name.trim())
            .map(|factory| factory(tools))
            .ok_or_else(|| RegistryError::UnknownListener(name.to_string()))
    }

    pub fn build_identity_provider(
        &self,
        name: &str,
        tools: &Arc<ToolRegistry>,
    ) -> Result<Arc<dyn IdentityProvider>, RegistryError> {
        self.identity_providers
            .get(name.trim())
            .map(|factory| factory(tools))
            .ok_or_else(|| RegistryError::UnknownIdentityProvider(name.to_string()))
    }
}
