//! The request router: one transaction per HTTP request.
//!
//! Reserved routes are answered first. Everything else is located in an
//! application, resolved to a static file, a controller, a redirect or
//! nothing, and executed. Every failure is turned into a structured error
//! response here; nothing escapes to the transport.
use std::{net::SocketAddr, path::Path, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{HeaderValue, StatusCode, header},
    middleware,
};
use hyper::Response;
use tower_http::compression::CompressionLayer;
use tracing::Instrument;

use crate::{
    adapters::{
        body::parse_body,
        middleware::{
            RequestId, request_id_middleware, request_timing_middleware, server_header_middleware,
        },
        session_store::SessionTracker,
        static_files::StaticFileAdapter,
    },
    core::{
        RoutingEngine,
        application::{ApplicationContext, FilterBinding, RouteTarget},
        controller::{
            ConsoleSink, ControllerContext, ControllerFault, ControllerRequest, ControllerResponse,
            DocumentReader, FilterAction, ResponseHandle,
        },
        error::{ErrorFormat, ErrorPayload, ErrorTitle, RouteError},
        file_path::{FilePath, belongs_to},
        invoker::ControllerTarget,
    },
    metrics::{self, RequestTimer},
    ports::static_files::{StaticFileError, StaticFiles},
    tracing_setup::create_request_span,
};

/// HTTP handler for Atrium
#[derive(Clone)]
pub struct HttpHandler {
    engine: Arc<RoutingEngine>,
    static_files: StaticFileAdapter,
    sessions: Arc<SessionTracker>,
}

impl HttpHandler {
    pub fn new(engine: Arc<RoutingEngine>, sessions: Arc<SessionTracker>) -> Self {
        let static_files = StaticFileAdapter::new(engine.config().statics.max_age_secs);
        Self {
            engine,
            static_files,
            sessions,
        }
    }

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Run one transaction. Always produces a response.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let method = req.method().clone();
        let raw_path = req.uri().path().to_string();
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let span = create_request_span(method.as_str(), &raw_path, &request_id);
        let timer = RequestTimer::new(method.as_str());

        let response = self
            .dispatch(req, &raw_path, client_addr)
            .instrument(span.clone())
            .await;

        let status = response.status().as_u16();
        span.record("http.status_code", status);
        span.record("duration_ms", timer.elapsed_ms());
        metrics::increment_request_total(method.as_str(), status);
        span.in_scope(|| {
            tracing::info!(method = %method, path = %raw_path, status, "Request completed");
        });

        response
    }

    async fn dispatch(
        &self,
        req: Request<AxumBody>,
        raw_path: &str,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let reserved = &self.engine.config().reserved;

        if raw_path == "/favicon.ico" {
            return match &reserved.favicon {
                Some(favicon) => self.serve_static(Path::new(favicon), req, raw_path).await,
                None => self.error_response(&ErrorPayload::not_found(raw_path), ErrorFormat::Html),
            };
        }
        if raw_path == reserved.status_path {
            return self.handle_status();
        }
        if belongs_to(raw_path, &reserved.resources_prefix) {
            let rest = &raw_path[reserved.resources_prefix.len()..];
            return match &reserved.resources_dir {
                Some(dir) => match self.static_files.serve_dir(Path::new(dir), rest, req).await {
                    Ok(response) => response,
                    Err(e) => self.static_failure(&e, raw_path),
                },
                None => self.error_response(&ErrorPayload::not_found(raw_path), ErrorFormat::Html),
            };
        }

        self.handle_application(req, raw_path, client_addr).await
    }

    /// JSON view of the published applications.
    fn handle_status(&self) -> Response<AxumBody> {
        let registry = self.engine.registry();
        let status_data = serde_json::json!({
            "service": "atrium",
            "version": env!("CARGO_PKG_VERSION"),
            "applications": registry.applications(),
            "sessions": {
                "tracked": registry.tracked_sessions(),
                "cookies": self.sessions.len(),
            },
            "reloads": metrics::reload_outcomes(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let mut response = Response::new(AxumBody::from(status_data.to_string()));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }

    async fn handle_application(
        &self,
        req: Request<AxumBody>,
        raw_path: &str,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let (context, path) = match self.engine.registry().locate(raw_path) {
            Ok(found) => found,
            Err(error) => return self.route_failure(&error, raw_path),
        };
        tracing::Span::current().record("app.context_path", context.context_path());

        match context.resolve_route(&path).await {
            RouteTarget::Static(file) => self.serve_static(&file, req, raw_path).await,
            RouteTarget::Redirect(location) => redirect(&location, req.uri().query()),
            RouteTarget::NotFound => self.route_failure(
                &RouteError::NotFound {
                    path: raw_path.to_string(),
                },
                raw_path,
            ),
            RouteTarget::Controller { target, filters } => {
                self.run_controller(&context, path, &target, &filters, req, client_addr)
                    .await
            }
        }
    }

    async fn run_controller(
        &self,
        context: &Arc<ApplicationContext>,
        path: FilePath,
        target: &ControllerTarget,
        filters: &[FilterBinding],
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let raw_path = path.raw_path.clone();
        let (parts, body) = req.into_parts();

        let bytes = match axum::body::to_bytes(body, self.engine.config().max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let fault = ControllerFault::Body(format!("unreadable request body: {e}"));
                return self.route_failure(&RouteError::Fault(fault), &raw_path);
            }
        };
        let body = match parse_body(&parts.headers, bytes).await {
            Ok(body) => body,
            Err(fault) => return self.route_failure(&RouteError::Fault(fault), &raw_path),
        };

        let ticket = self.sessions.ticket(&parts.headers).await;
        let session = self
            .engine
            .registry()
            .session_for(context, &ticket.id)
            .await;

        let request = ControllerRequest::new(parts.method, parts.uri, parts.headers, path)
            .with_body(body)
            .with_remote_addr(client_addr);
        let ctx = ControllerContext {
            request: Arc::new(request),
            response: ResponseHandle::new(),
            session,
            tools: context.tools().clone(),
            documents: DocumentReader::new(context.docroot()),
            console: ConsoleSink::new(context.context_path()),
            identity: context.identity(),
        };

        tracing::debug!(controller = %target.describe(), filters = filters.len(), "Invoking controller");
        let mut response = match self.run_chain(target, filters, &ctx).await {
            Ok(()) => into_http(ctx.response.take()),
            Err(fault) => {
                let format = {
                    let partial = ctx.response.lock();
                    ErrorFormat::from_content_type(partial.content_type())
                };
                log_fault(&fault, &raw_path);
                self.error_response(&ErrorPayload::from_fault(&fault), format)
            }
        };

        if let Some(cookie) = ticket.set_cookie {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
        response
    }

    /// Filters in declaration order, then the controller unless one halted.
    async fn run_chain(
        &self,
        target: &ControllerTarget,
        filters: &[FilterBinding],
        ctx: &ControllerContext,
    ) -> Result<(), ControllerFault> {
        for binding in filters {
            if binding.filter.apply(ctx).await? == FilterAction::Halt {
                tracing::debug!(filter = %binding.name, "Filter halted the chain");
                return Ok(());
            }
        }
        self.engine.invoker().invoke(target, ctx).await
    }

    async fn serve_static(
        &self,
        file: &Path,
        req: Request<AxumBody>,
        raw_path: &str,
    ) -> Response<AxumBody> {
        match self.static_files.serve_file(file, req).await {
            Ok(response) => response,
            Err(e) => self.static_failure(&e, raw_path),
        }
    }

    fn static_failure(&self, error: &StaticFileError, raw_path: &str) -> Response<AxumBody> {
        match error {
            StaticFileError::NotFound(_) => {
                tracing::debug!(path = raw_path, error = %error, "Static file missing");
                self.error_response(&ErrorPayload::not_found(raw_path), ErrorFormat::Html)
            }
            _ => {
                tracing::error!(path = raw_path, error = %error, "Failed to serve static file");
                self.error_response(
                    &ErrorPayload::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorTitle::Error,
                        "The resource could not be read",
                    ),
                    ErrorFormat::Html,
                )
            }
        }
    }

    fn route_failure(&self, error: &RouteError, raw_path: &str) -> Response<AxumBody> {
        match error {
            RouteError::NotFound { .. } => tracing::debug!(path = raw_path, "No route"),
            RouteError::Redirect { location } => return redirect(location, None),
            RouteError::Fault(fault) => log_fault(fault, raw_path),
            RouteError::Context(e) => {
                tracing::error!(path = raw_path, error = %e, "Application context unavailable")
            }
        }
        self.error_response(
            &ErrorPayload::from_route_error(error, raw_path),
            ErrorFormat::Html,
        )
    }

    fn error_response(&self, payload: &ErrorPayload, format: ErrorFormat) -> Response<AxumBody> {
        let mut response = Response::new(AxumBody::from(payload.render(format)));
        *response.status_mut() = payload.status_code();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(format.content_type()),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

fn log_fault(fault: &ControllerFault, raw_path: &str) {
    if fault.status().is_server_error() {
        tracing::error!(path = raw_path, title = fault.title().as_str(), error = ?fault, "Controller failed");
    } else {
        tracing::warn!(path = raw_path, title = fault.title().as_str(), error = %fault, "Request rejected");
    }
}

fn redirect(location: &str, query: Option<&str>) -> Response<AxumBody> {
    let location = match query {
        Some(query) => format!("{location}?{query}"),
        None => location.to_string(),
    };
    let mut response = Response::new(AxumBody::empty());
    *response.status_mut() = StatusCode::FOUND;
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
        }
        Err(e) => {
            tracing::error!(location, error = %e, "Invalid redirect location");
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    response
}

fn into_http(response: ControllerResponse) -> Response<AxumBody> {
    let (status, headers, body) = response.into_parts();
    let mut http_response = Response::new(AxumBody::from(body));
    *http_response.status_mut() = status;
    *http_response.headers_mut() = headers;
    http_response
}

/// Router sending every request through `handler`.
pub fn build_router(handler: Arc<HttpHandler>) -> Router {
    Router::new()
        .fallback(move |req: Request| {
            let handler = handler.clone();
            async move {
                let client_addr = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| *addr);
                handler.handle_request(req, client_addr).await
            }
        })
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(server_header_middleware))
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::models::{ReservedRoutesConfig, ServerConfig},
        ports::script_engine::{ScriptBindings, ScriptEngine, ScriptError},
    };

    struct NoScripts;

    impl ScriptEngine for NoScripts {
        fn evaluate(&self, script: &Path, _: ScriptBindings) -> Result<(), ScriptError> {
            Err(ScriptError::NotFound(script.display().to_string()))
        }
    }

    fn handler(config: ServerConfig) -> Arc<HttpHandler> {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionTracker::new(&config.session));
        let engine = Arc::new(RoutingEngine::builder(config, Arc::new(NoScripts)).build());
        Arc::new(HttpHandler::new(engine, sessions))
    }

    async fn get(handler: &Arc<HttpHandler>, uri: &str) -> Response<AxumBody> {
        build_router(handler.clone())
            .oneshot(Request::builder().uri(uri).body(AxumBody::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let handler = handler(ServerConfig::default());
        let response = get(&handler, "/_status").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["service"], "atrium");
        assert!(json["applications"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_context_is_not_found() {
        let handler = handler(ServerConfig::default());
        let response = get(&handler, "/nowhere").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("NOT_FOUND_ERROR"));
    }

    #[tokio::test]
    async fn test_favicon_without_configuration() {
        let handler = handler(ServerConfig::default());
        assert_eq!(get(&handler, "/favicon.ico").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shared_resources() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        let config = ServerConfig::builder()
            .reserved(ReservedRoutesConfig {
                resources_dir: Some(dir.path().display().to_string()),
                ..ReservedRoutesConfig::default()
            })
            .build();
        let handler = handler(config);

        let response = get(&handler, "/_static/app.js").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::LAST_MODIFIED));

        assert_eq!(
            get(&handler, "/_static/none.js").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_redirect_keeps_query() {
        let response = redirect("/app/docs/", Some("page=2"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/app/docs/?page=2");
    }
}
