//! Shared harness: a temporary webapps tree behind a fully wired router.
#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc};

use atrium::{
    ConfigWatcher, HttpHandler, RhaiScriptEngine, RoutingEngine, SessionTracker,
    adapters::build_router, config::ServerConfig,
};
use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt; // for oneshot

pub struct TestHost {
    pub dir: TempDir,
    pub engine: Arc<RoutingEngine>,
    pub watcher: ConfigWatcher,
    pub router: Router,
}

impl TestHost {
    /// Write the given files under the webapps root, then scan and publish.
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        for (relative, contents) in files {
            write_file(&dir.path().join(relative), contents);
        }

        let config = Arc::new(
            ServerConfig::builder()
                .webapps_dir(dir.path().display().to_string())
                .build(),
        );
        let scripts = Arc::new(RhaiScriptEngine::new(&config.scripts));
        let engine = Arc::new(RoutingEngine::builder(config.clone(), scripts).build());
        let watcher = ConfigWatcher::from_config(&config, engine.clone());
        watcher.scan().unwrap();
        engine.warm_up().unwrap();

        let sessions = Arc::new(SessionTracker::new(&config.session));
        let router = build_router(Arc::new(HttpHandler::new(engine.clone(), sessions)));

        Self {
            dir,
            engine,
            watcher,
            router,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.watcher.webapps_dir().join(relative)
    }

    /// Overwrite a file and apply the change as the watcher would.
    pub fn rewrite(&self, relative: &str, contents: &str) {
        let path = self.path(relative);
        write_file(&path, contents);
        self.watcher.apply(&path);
    }

    /// Delete a file and apply the change as the watcher would.
    pub fn remove(&self, relative: &str) {
        let path = self.path(relative);
        std::fs::remove_file(&path).unwrap();
        self.watcher.apply(&path);
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn get_with_cookie(&self, uri: &str, cookie: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .uri(uri)
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

fn write_file(path: &std::path::Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// `name=value` part of a `Set-Cookie` header.
pub fn session_cookie(response: &Response<Body>) -> String {
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}
