//! One live web application: compiled routes, controller instances and sessions.
//!
//! An [`ApplicationContext`] is built in full from an [`AggregateDefinition`]
//! before anyone can see it and is never mutated afterwards, apart from its
//! session table. A reload builds a new context; the old one stays alive for
//! as long as in-flight requests or not-yet-invalidated sessions hold it.
use std::{
    collections::HashMap,
    fmt,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;

use crate::core::{
    controller::{
        ContextListener, Controller, ControllerRegistry, Filter, IdentityProvider,
    },
    definitions::AggregateDefinition,
    file_path::{FilePath, join_confined},
    invoker::ControllerTarget,
    path_bind::{self, InvalidPatternError, RouteRule},
    session::SessionRecord,
    tools::ToolRegistry,
};

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ContextError {
    #[error("Application '{context_path}' requires unknown identity provider '{name}'")]
    UnknownIdentityProvider { context_path: String, name: String },

    #[error(transparent)]
    InvalidPattern(#[from] InvalidPatternError),
}

#[derive(Clone)]
pub struct FilterBinding {
    pub name: String,
    pub filter: Arc<dyn Filter>,
}

impl fmt::Debug for FilterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FilterBinding").field(&self.name).finish()
    }
}

/// Outcome of resolving a request path inside one application.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Static(PathBuf),
    Controller {
        target: ControllerTarget,
        filters: Vec<FilterBinding>,
    },
    /// Directory requested without its trailing slash
    Redirect(String),
    NotFound,
}

struct ControllerRoute {
    rule: RouteRule,
    /// `None` for script routes, whose template expands per request
    compiled: Option<Arc<dyn Controller>>,
}

/// Shared dependencies for building contexts.
#[derive(Clone)]
pub struct ContextFactory {
    pub controllers: Arc<ControllerRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub script_extension: String,
}

impl ContextFactory {
    pub fn new(
        controllers: Arc<ControllerRegistry>,
        tools: Arc<ToolRegistry>,
        script_extension: impl Into<String>,
    ) -> Self {
        Self {
            controllers,
            tools,
            script_extension: script_extension.into(),
        }
    }

    fn is_script(&self, spec: &str) -> bool {
        spec.trim()
            .strip_suffix(self.script_extension.as_str())
            .is_some_and(|stem| stem.ends_with('.'))
    }

    /// The extension of a handler spec that names a script file in some
    /// other language, e.g. `pages/$1.js` while scripts are `.rhai`.
    fn foreign_script_extension<'a>(&self, spec: &'a str) -> Option<&'a str> {
        let (stem, extension) = spec.trim().rsplit_once('.')?;
        let is_extension = !stem.is_empty()
            && !extension.is_empty()
            && extension
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        (is_extension && extension != self.script_extension).then_some(extension)
    }

    /// Build a context. Unknown controllers, filters and listeners are logged
    /// and their registrations skipped; an unknown identity provider fails
    /// the whole build.
    pub fn build(
        &self,
        aggregate: Arc<AggregateDefinition>,
    ) -> Result<ApplicationContext, ContextError> {
        let definition = &aggregate.definition;
        let context_path = aggregate.context_path.as_str();

        let identity = match &definition.identity_manager {
            Some(name) => Some(
                self.controllers
                    .build_identity_provider(name, &self.tools)
                    .map_err(|_| ContextError::UnknownIdentityProvider {
                        context_path: context_path.to_string(),
                        name: name.clone(),
                    })?,
            ),
            None => None,
        };

        let mut statics = Vec::with_capacity(definition.statics.len());
        for (route, target) in definition.statics.iter() {
            let rule = RouteRule::compile(route, target)?;
            let template = static_template(target, rule.capture_count());
            statics.push(rule.with_replacement(template));
        }

        let mut controllers = Vec::with_capacity(definition.controllers.len());
        for (route, spec) in definition.controllers.iter() {
            let rule = RouteRule::compile(route, spec.trim())?;
            if self.is_script(spec) {
                controllers.push(ControllerRoute {
                    rule,
                    compiled: None,
                });
                continue;
            }
            if let Some(extension) = self.foreign_script_extension(spec) {
                tracing::error!(
                    context_path,
                    route,
                    spec,
                    extension,
                    script_extension = %self.script_extension,
                    "Skipping script route: scripts must use the configured script extension"
                );
                continue;
            }
            match self.controllers.build_controller(spec, &self.tools) {
                Ok(controller) => controllers.push(ControllerRoute {
                    rule,
                    compiled: Some(controller),
                }),
                Err(e) => {
                    tracing::error!(context_path, route, spec, error = %e, "Skipping controller route");
                }
            }
        }

        // Each filter rule rewrites to its filter name.
        let mut filters = Vec::with_capacity(definition.filters.len());
        let mut filter_bindings = HashMap::new();
        for (route, name) in definition.filters.iter() {
            let name = name.trim();
            let rule = RouteRule::compile(route, name.replace('$', "$$"))?;
            if filter_bindings.contains_key(name) {
                filters.push(rule);
                continue;
            }
            match self.controllers.build_filter(name, &self.tools) {
                Ok(filter) => {
                    filter_bindings.insert(
                        name.to_string(),
                        FilterBinding {
                            name: name.to_string(),
                            filter,
                        },
                    );
                    filters.push(rule);
                }
                Err(e) => {
                    tracing::error!(context_path, route, filter = name, error = %e, "Skipping filter route");
                }
            }
        }

        let mut listeners = Vec::with_capacity(definition.listeners.len());
        for name in &definition.listeners {
            match self.controllers.build_listener(name, &self.tools) {
                Ok(listener) => listeners.push((name.clone(), listener)),
                Err(e) => {
                    tracing::error!(context_path, listener = %name, error = %e, "Skipping listener");
                }
            }
        }

        Ok(ApplicationContext {
            context_path: aggregate.context_path.clone(),
            docroot: aggregate.docroot.clone(),
            aggregate,
            statics,
            controllers,
            filters,
            filter_bindings,
            listeners,
            identity,
            tools: self.tools.clone(),
            script_extension: self.script_extension.clone(),
            sessions: scc::HashMap::new(),
        })
    }
}

/// A static target without `$` on a capturing pattern serves the capture
/// beneath the target.
fn static_template(target: &str, captures: usize) -> String {
    if target.contains('$') || captures == 0 {
        target.to_string()
    } else {
        format!("{}/${{1}}", target.trim_end_matches('/'))
    }
}

pub struct ApplicationContext {
    context_path: String,
    docroot: PathBuf,
    aggregate: Arc<AggregateDefinition>,
    statics: Vec<RouteRule>,
    controllers: Vec<ControllerRoute>,
    filters: Vec<RouteRule>,
    filter_bindings: HashMap<String, FilterBinding>,
    listeners: Vec<(String, Arc<dyn ContextListener>)>,
    identity: Option<Arc<dyn IdentityProvider>>,
    tools: Arc<ToolRegistry>,
    script_extension: String,
    sessions: scc::HashMap<String, Arc<SessionRecord>>,
}

impl fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("context_path", &self.context_path)
            .field("generation", &self.aggregate.generation)
            .field("statics", &self.statics.len())
            .field("controllers", &self.controllers.len())
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl ApplicationContext {
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn docroot(&self) -> &Path {
        &self.docroot
    }

    pub fn generation(&self) -> u64 {
        self.aggregate.generation
    }

    pub fn aggregate(&self) -> &Arc<AggregateDefinition> {
        &self.aggregate
    }

    /// Identity, not equality: a context is current only for the exact
    /// aggregate it was built from.
    pub fn is_built_from(&self, aggregate: &Arc<AggregateDefinition>) -> bool {
        Arc::ptr_eq(&self.aggregate, aggregate)
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn identity(&self) -> Option<Arc<dyn IdentityProvider>> {
        self.identity.clone()
    }

    /// Number of controller routes that survived registration.
    pub fn controller_route_count(&self) -> usize {
        self.controllers.len()
    }

    /// Resolve a request path: statics first, then declared controller
    /// routes, then a script found by convention beside the path.
    pub async fn resolve_route(&self, path: &FilePath) -> RouteTarget {
        let local = path.local_path.as_str();

        if let Some(resolved) = path_bind::resolve(&self.statics, local) {
            return match self.static_file(&resolved) {
                Some(file) => RouteTarget::Static(file),
                None => RouteTarget::NotFound,
            };
        }

        for route in &self.controllers {
            let Some(expanded) = route.rule.apply(local) else {
                continue;
            };
            let target = match &route.compiled {
                Some(controller) => ControllerTarget::Compiled {
                    spec: route.rule.replacement().to_string(),
                    controller: controller.clone(),
                },
                None => match join_confined(&self.docroot, &expanded) {
                    Some(script) => ControllerTarget::Script(script),
                    None => return RouteTarget::NotFound,
                },
            };
            return self.controller(target, local);
        }

        self.resolve_by_convention(path).await
    }

    async fn resolve_by_convention(&self, path: &FilePath) -> RouteTarget {
        let Some(candidate) = path.resolve_under(&self.docroot) else {
            return RouteTarget::NotFound;
        };

        let is_dir = tokio::fs::metadata(&candidate)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        if is_dir {
            if !path.is_directory_form() {
                return RouteTarget::Redirect(format!("{}/", path.raw_path));
            }
            let index = candidate.join(format!("index.{}", self.script_extension));
            if is_file(&index).await {
                return self.controller(ControllerTarget::Script(index), &path.local_path);
            }
            return RouteTarget::NotFound;
        }

        if path.remainder.is_empty() || path.is_directory_form() {
            return RouteTarget::NotFound;
        }
        let mut sibling = candidate.into_os_string();
        sibling.push(".");
        sibling.push(&self.script_extension);
        let sibling = PathBuf::from(sibling);
        if is_file(&sibling).await {
            return self.controller(ControllerTarget::Script(sibling), &path.local_path);
        }
        RouteTarget::NotFound
    }

    fn controller(&self, target: ControllerTarget, local_path: &str) -> RouteTarget {
        RouteTarget::Controller {
            target,
            filters: self.filters_for(local_path),
        }
    }

    /// Every filter whose pattern matches, in declaration order.
    pub fn filters_for(&self, local_path: &str) -> Vec<FilterBinding> {
        path_bind::resolve_all(&self.filters, local_path)
            .filter_map(|name| self.filter_bindings.get(&name).cloned())
            .collect()
    }

    fn static_file(&self, resolved: &str) -> Option<PathBuf> {
        let candidate = Path::new(resolved);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return None;
        }
        if candidate.is_absolute() {
            Some(candidate.to_path_buf())
        } else {
            join_confined(&self.docroot, resolved)
        }
    }

    pub async fn session(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions
            .read_async(id, |_, record| record.clone())
            .await
            .filter(|record| !record.is_invalidated())
    }

    /// The record for `id`, created if this context has none yet. An
    /// invalidated record is replaced by a fresh one.
    pub async fn open_session(&self, id: &str) -> Arc<SessionRecord> {
        let mut entry = self
            .sessions
            .entry_async(id.to_string())
            .await
            .or_insert_with(|| Arc::new(SessionRecord::new(id)));
        if entry.get().is_invalidated() {
            *entry.get_mut() = Arc::new(SessionRecord::new(id));
        }
        entry.get().clone()
    }

    /// Share a record created under an earlier context of this application.
    pub async fn adopt_session(&self, record: Arc<SessionRecord>) -> Arc<SessionRecord> {
        let entry = self
            .sessions
            .entry_async(record.id().to_string())
            .await
            .or_insert(record);
        entry.get().clone()
    }

    /// Invalidate and forget `id`. Returns whether this context held it.
    pub async fn invalidate_session(&self, id: &str) -> bool {
        match self.sessions.remove_async(id).await {
            Some((_, record)) => {
                record.invalidate();
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn notify_initialized(&self) {
        for (name, listener) in &self.listeners {
            tracing::debug!(context_path = %self.context_path, listener = %name, "context_initialized");
            listener.context_initialized(&self.context_path);
        }
    }
}

impl Drop for ApplicationContext {
    fn drop(&mut self) {
        tracing::info!(
            context_path = %self.context_path,
            generation = self.aggregate.generation,
            "Application context drained"
        );
        for (_, listener) in &self.listeners {
            listener.context_destroyed(&self.context_path);
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::core::{controller::tests::Echo, definition::WebappDefinition};

    fn factory() -> ContextFactory {
        let mut registry = ControllerRegistry::with_builtins();
        registry.register_controller("Echo", |_| {
            Arc::new(Echo {
                prefix: "",
                body: "echo",
            })
        });
        ContextFactory::new(Arc::new(registry), Arc::new(ToolRegistry::new()), "rhai")
    }

    fn aggregate(docroot: &Path, json: &str) -> Arc<AggregateDefinition> {
        Arc::new(AggregateDefinition {
            context_path: "/app".to_string(),
            docroot: docroot.to_path_buf(),
            definition: WebappDefinition::from_json(json.as_bytes()).unwrap(),
            generation: 1,
            files: vec![],
        })
    }

    fn docroot() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("assets/css")).unwrap();
        std::fs::write(dir.path().join("assets/css/site.css"), "body{}").unwrap();
        std::fs::create_dir_all(dir.path().join("blog")).unwrap();
        std::fs::write(dir.path().join("blog/index.rhai"), "").unwrap();
        std::fs::write(dir.path().join("about.rhai"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        dir
    }

    fn path(raw: &str) -> FilePath {
        FilePath::new(raw, "/app").unwrap()
    }

    #[tokio::test]
    async fn test_static_rule_wins_over_controller() {
        let dir = docroot();
        let ctx = factory()
            .build(aggregate(
                dir.path(),
                r#"{"statics": {"/css/*": "assets/css"}, "controllers": {"/css/*": "Echo"}}"#,
            ))
            .unwrap();

        match ctx.resolve_route(&path("/app/css/site.css")).await {
            RouteTarget::Static(file) => assert_eq!(file, dir.path().join("assets/css/site.css")),
            other => panic!("expected static, got {other:?}"),
        }
        assert!(matches!(
            ctx.resolve_route(&path("/app/css/../../secret")).await,
            RouteTarget::NotFound
        ));
    }

    #[tokio::test]
    async fn test_explicit_controllers_before_convention() {
        let dir = docroot();
        let ctx = factory()
            .build(aggregate(
                dir.path(),
                r#"{"controllers": {"/about": "Echo", "/pages/*": "views/$1.rhai"}}"#,
            ))
            .unwrap();

        match ctx.resolve_route(&path("/app/about")).await {
            RouteTarget::Controller {
                target: ControllerTarget::Compiled { spec, .. },
                ..
            } => assert_eq!(spec, "Echo"),
            other => panic!("expected compiled controller, got {other:?}"),
        }
        match ctx.resolve_route(&path("/app/pages/home")).await {
            RouteTarget::Controller {
                target: ControllerTarget::Script(script),
                ..
            } => assert_eq!(script, dir.path().join("views/home.rhai")),
            other => panic!("expected script, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_convention_redirect_index_and_sibling() {
        let dir = docroot();
        let ctx = factory().build(aggregate(dir.path(), "{}")).unwrap();

        match ctx.resolve_route(&path("/app/blog")).await {
            RouteTarget::Redirect(location) => assert_eq!(location, "/app/blog/"),
            other => panic!("expected redirect, got {other:?}"),
        }
        match ctx.resolve_route(&path("/app/blog/")).await {
            RouteTarget::Controller {
                target: ControllerTarget::Script(script),
                ..
            } => assert_eq!(script, dir.path().join("blog/index.rhai")),
            other => panic!("expected index script, got {other:?}"),
        }
        match ctx.resolve_route(&path("/app/about")).await {
            RouteTarget::Controller {
                target: ControllerTarget::Script(script),
                ..
            } => assert_eq!(script, dir.path().join("about.rhai")),
            other => panic!("expected sibling script, got {other:?}"),
        }
        assert!(matches!(
            ctx.resolve_route(&path("/app/empty/")).await,
            RouteTarget::NotFound
        ));
        assert!(matches!(
            ctx.resolve_route(&path("/app/missing")).await,
            RouteTarget::NotFound
        ));
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let dir = docroot();
        let ctx = factory()
            .build(aggregate(dir.path(), r#"{"controllers": {"/a/*": "Echo", "/a/b": "Health"}}"#))
            .unwrap();
        for _ in 0..10 {
            match ctx.resolve_route(&path("/app/a/b")).await {
                RouteTarget::Controller {
                    target: ControllerTarget::Compiled { spec, .. },
                    ..
                } => assert_eq!(spec, "Echo"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    struct Pass;

    #[async_trait::async_trait]
    impl Filter for Pass {
        async fn apply(
            &self,
            _ctx: &crate::core::controller::ControllerContext,
        ) -> Result<crate::core::controller::FilterAction, crate::core::controller::ControllerFault>
        {
            Ok(crate::core::controller::FilterAction::Continue)
        }
    }

    #[tokio::test]
    async fn test_filters_match_in_declaration_order() {
        let dir = docroot();
        let mut registry = ControllerRegistry::with_builtins();
        registry.register_filter("Audit", |_| Arc::new(Pass));
        registry.register_filter("Guard", |_| Arc::new(Pass));
        let factory = ContextFactory::new(Arc::new(registry), Arc::new(ToolRegistry::new()), "rhai");

        let ctx = factory
            .build(aggregate(
                dir.path(),
                r#"{"filters": {"/*": "Audit", "/admin/*": "Guard", "/other/*": "Audit", "/x/*": "Missing"}}"#,
            ))
            .unwrap();

        let names = |path: &str| -> Vec<String> {
            ctx.filters_for(path).into_iter().map(|b| b.name).collect()
        };
        assert_eq!(names("/admin/panel"), vec!["Audit", "Guard"]);
        assert_eq!(names("/other/page"), vec!["Audit", "Audit"]);
        assert_eq!(names("/x/y"), vec!["Audit"]);
    }

    #[tokio::test]
    async fn test_script_in_foreign_language_is_skipped() {
        let dir = docroot();
        let factory = factory();
        assert_eq!(factory.foreign_script_extension("pages/$1.js"), Some("js"));
        assert_eq!(factory.foreign_script_extension("pages/$1.rhai"), None);
        assert_eq!(factory.foreign_script_extension("Health"), None);
        assert_eq!(factory.foreign_script_extension("com.example.Health"), None);

        let ctx = factory
            .build(aggregate(
                dir.path(),
                r#"{"controllers": {"/legacy/*": "legacy/$1.js", "/y": "Echo", "/p/*": "p/$1.rhai"}}"#,
            ))
            .unwrap();
        assert_eq!(ctx.controller_route_count(), 2);
        assert!(matches!(
            ctx.resolve_route(&path("/app/legacy/page")).await,
            RouteTarget::NotFound
        ));
    }

    #[tokio::test]
    async fn test_unknown_controller_skipped_unknown_identity_fatal() {
        let dir = docroot();
        let ctx = factory()
            .build(aggregate(
                dir.path(),
                r#"{"controllers": {"/x": "Missing", "/y": "Echo"}, "listeners": ["Nobody"]}"#,
            ))
            .unwrap();
        assert_eq!(ctx.controller_route_count(), 1);

        let err = factory()
            .build(aggregate(dir.path(), r#"{"identity_manager": "Ldap"}"#))
            .unwrap_err();
        assert!(matches!(err, ContextError::UnknownIdentityProvider { .. }));

        assert!(factory()
            .build(aggregate(dir.path(), r#"{"identity_manager": "SessionAttribute"}"#))
            .unwrap()
            .identity()
            .is_some());
    }

    #[tokio::test]
    async fn test_listeners_see_initialization_and_drain() {
        struct Counting(Arc<AtomicUsize>, Arc<AtomicUsize>);
        impl ContextListener for Counting {
            fn context_initialized(&self, _: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn context_destroyed(&self, _: &str) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut registry = ControllerRegistry::new();
        let (s, t) = (started.clone(), stopped.clone());
        registry.register_listener("Counting", move |_| {
            Arc::new(Counting(s.clone(), t.clone()))
        });
        let factory =
            ContextFactory::new(Arc::new(registry), Arc::new(ToolRegistry::new()), "rhai");

        let dir = docroot();
        let ctx = factory
            .build(aggregate(dir.path(), r#"{"listeners": ["Counting"]}"#))
            .unwrap();
        ctx.notify_initialized();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        drop(ctx);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_table() {
        let dir = docroot();
        let ctx = factory().build(aggregate(dir.path(), "{}")).unwrap();

        let first = ctx.open_session("s1").await;
        let again = ctx.open_session("s1").await;
        assert!(Arc::ptr_eq(&first, &again));
        first.set_attribute("k", serde_json::json!(1));

        assert!(ctx.invalidate_session("s1").await);
        assert!(ctx.session("s1").await.is_none());
        assert_eq!(first.get_attribute("k"), None);
        assert!(!ctx.invalidate_session("s1").await);
    }

    #[test]
    fn test_static_template() {
        assert_eq!(static_template("assets/css", 1), "assets/css/${1}");
        assert_eq!(static_template("/srv/favicon.ico", 0), "/srv/favicon.ico");
        assert_eq!(static_template("files/$1.txt", 1), "files/$1.txt");
    }
}
