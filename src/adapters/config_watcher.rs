//! Hot reload of application definition files.
//!
//! Layout under the webapps directory:
//!
//! ```text
//! webapps/
//!   ROOT/app.json        -> context path "/"
//!   shop/00-base.json    -> context path "/shop"
//!   shop/10-admin.json   -> merged after 00-base.json
//! ```
//!
//! Every change is applied file by file: a file that parses replaces its
//! previous contribution, a file that parses to nothing or disappears is
//! unloaded, and a file that fails to parse leaves the previous state alone.
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use eyre::{Result, WrapErr};
use notify::{RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::models::ServerConfig,
    core::{definition::WebappDefinition, definitions::DefinitionSource},
    metrics,
    ports::definition_sink::DefinitionSink,
    tracing_setup::create_reload_span,
    utils::ShutdownToken,
};

/// Directory name mapped to the root context path.
pub const ROOT_APPLICATION: &str = "ROOT";

/// What applying one file change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Loaded,
    Unloaded,
    /// The file failed to parse; whatever it contributed before stays
    Rejected,
    /// Not a definition file, or nothing to do
    Ignored,
}

impl ReloadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadOutcome::Loaded => "loaded",
            ReloadOutcome::Unloaded => "unloaded",
            ReloadOutcome::Rejected => "rejected",
            ReloadOutcome::Ignored => "ignored",
        }
    }
}

pub struct ConfigWatcher {
    webapps_dir: PathBuf,
    sink: Arc<dyn DefinitionSink>,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(webapps_dir: impl Into<PathBuf>, sink: Arc<dyn DefinitionSink>) -> Self {
        let webapps_dir = webapps_dir.into();
        // Watch events carry canonical paths
        let webapps_dir = std::fs::canonicalize(&webapps_dir).unwrap_or(webapps_dir);
        Self {
            webapps_dir,
            sink,
            debounce: Duration::from_millis(250),
        }
    }

    pub fn from_config(config: &ServerConfig, sink: Arc<dyn DefinitionSink>) -> Self {
        Self::new(&config.webapps_dir, sink)
            .with_debounce(Duration::from_millis(config.reload.debounce_ms))
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn webapps_dir(&self) -> &Path {
        &self.webapps_dir
    }

    /// Map `<webapps_dir>/<app>/<name>.json` to its application.
    pub fn locate(&self, file: &Path) -> Option<DefinitionSource> {
        if file.extension().and_then(|e| e.to_str()) != Some("json") {
            return None;
        }
        let file_name = file.file_name()?.to_str()?;
        if file_name.starts_with('.') {
            return None;
        }
        let docroot = file.parent()?;
        self.context_path_of(docroot).map(|context_path| DefinitionSource {
            file: file.to_path_buf(),
            context_path,
            docroot: docroot.to_path_buf(),
        })
    }

    /// Context path of an application directory directly under the webapps dir.
    fn context_path_of(&self, dir: &Path) -> Option<String> {
        if dir.parent()? != self.webapps_dir {
            return None;
        }
        let name = dir.file_name()?.to_str()?;
        if name.starts_with('.') || name.is_empty() {
            return None;
        }
        Some(if name == ROOT_APPLICATION {
            "/".to_string()
        } else {
            format!("/{name}")
        })
    }

    /// Load every definition file in file-name order and drop tracked files
    /// that no longer exist. Returns the number of files loaded.
    pub fn scan(&self) -> Result<usize> {
        let mut apps = read_sorted(&self.webapps_dir).wrap_err_with(|| {
            format!(
                "Failed to read webapps directory {}",
                self.webapps_dir.display()
            )
        })?;
        apps.retain(|p| p.is_dir());

        let mut seen = BTreeSet::new();
        let mut loaded = 0;
        for app in apps {
            if self.context_path_of(&app).is_none() {
                continue;
            }
            for file in read_sorted(&app)
                .wrap_err_with(|| format!("Failed to read application {}", app.display()))?
            {
                if self.locate(&file).is_none() {
                    continue;
                }
                seen.insert(file.clone());
                if self.apply_file(&file) == ReloadOutcome::Loaded {
                    loaded += 1;
                }
            }
        }

        for stale in self.sink.tracked_files() {
            if !seen.contains(&stale) {
                self.apply_file(&stale);
            }
        }

        tracing::info!(
            webapps_dir = %self.webapps_dir.display(),
            files = loaded,
            "Application definitions scanned"
        );
        Ok(loaded)
    }

    /// Apply a change to any path under the webapps directory. Application
    /// directories that appear are loaded whole; ones that vanish unload
    /// every file they contributed.
    pub fn apply(&self, path: &Path) -> Vec<ReloadOutcome> {
        if path.is_dir() {
            if self.context_path_of(path).is_none() {
                return Vec::new();
            }
            return match read_sorted(path) {
                Ok(files) => files
                    .iter()
                    .filter(|f| self.locate(f).is_some())
                    .map(|f| self.apply_file(f))
                    .collect(),
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "Cannot read application directory");
                    Vec::new()
                }
            };
        }

        if self.locate(path).is_some() {
            return vec![self.apply_file(path)];
        }

        if !path.exists() {
            return self
                .sink
                .tracked_files()
                .iter()
                .filter(|tracked| tracked.starts_with(path))
                .map(|tracked| self.apply_file(tracked))
                .collect();
        }
        Vec::new()
    }

    /// Apply the current state of one definition file.
    pub fn apply_file(&self, file: &Path) -> ReloadOutcome {
        let Some(source) = self.locate(file) else {
            return ReloadOutcome::Ignored;
        };

        let span = create_reload_span(&file.display().to_string());
        let _enter = span.enter();
        span.record("app.context_path", source.context_path.as_str());

        let tracked = self.sink.tracked_files().iter().any(|f| f == file);
        let outcome = if !file.exists() {
            if tracked {
                self.sink.unload(file);
                ReloadOutcome::Unloaded
            } else {
                ReloadOutcome::Ignored
            }
        } else {
            match WebappDefinition::load(file) {
                Ok(definition) if definition.is_empty() => {
                    if tracked {
                        self.sink.unload(file);
                        ReloadOutcome::Unloaded
                    } else {
                        ReloadOutcome::Ignored
                    }
                }
                Ok(definition) => {
                    self.sink.load(source, definition);
                    ReloadOutcome::Loaded
                }
                Err(e) => {
                    tracing::warn!(
                        file = %file.display(),
                        error = %e,
                        "Definition rejected, keeping previous state"
                    );
                    ReloadOutcome::Rejected
                }
            }
        };

        span.record("outcome", outcome.as_str());
        if outcome != ReloadOutcome::Ignored {
            metrics::increment_config_reload(outcome.as_str());
            tracing::info!(file = %file.display(), outcome = outcome.as_str(), "Definition change applied");
        }
        outcome
    }

    /// Watch the webapps directory and apply changes until shutdown.
    ///
    /// Bursts of events are coalesced: after the first event the task waits
    /// for a quiet period of `debounce` before applying each distinct path
    /// once, in path order.
    pub fn watch(self: Arc<Self>, mut shutdown: ShutdownToken) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        for path in event.paths {
                            // Receiver gone means the watch task stopped
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Definition watch error"),
            })
            .wrap_err("Failed to create definition watcher")?;

        watcher
            .watch(&self.webapps_dir, RecursiveMode::Recursive)
            .wrap_err_with(|| format!("Failed to watch {}", self.webapps_dir.display()))?;

        tracing::info!(webapps_dir = %self.webapps_dir.display(), "Watching application definitions");

        Ok(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                let first = tokio::select! {
                    path = rx.recv() => match path {
                        Some(path) => path,
                        None => break,
                    },
                    _ = shutdown.wait_for_shutdown() => break,
                };

                let mut pending = BTreeSet::from([first]);
                while let Ok(Some(path)) = tokio::time::timeout(self.debounce, rx.recv()).await {
                    pending.insert(path);
                }

                let this = self.clone();
                let applied = tokio::task::spawn_blocking(move || {
                    for path in &pending {
                        this.apply(path);
                    }
                })
                .await;
                if let Err(e) = applied {
                    tracing::error!(error = %e, "Definition reload task failed");
                }
            }
            tracing::debug!("Definition watcher stopped");
        }))
    }
}

fn read_sorted(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::{core::definitions::DefinitionStore, utils::GracefulShutdown};

    struct Fixture {
        dir: TempDir,
        store: Arc<DefinitionStore>,
        watcher: Arc<ConfigWatcher>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(DefinitionStore::new());
            let watcher = Arc::new(
                ConfigWatcher::new(dir.path(), store.clone()).with_debounce(Duration::from_millis(50)),
            );
            Self { dir, store, watcher }
        }

        fn write(&self, relative: &str, json: &str) -> PathBuf {
            let path = self.watcher.webapps_dir().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, json).unwrap();
            path
        }

        fn controllers(&self, context_path: &str) -> Vec<String> {
            self.store
                .snapshot()
                .get(context_path)
                .map(|a| a.definition.controllers.routes().map(str::to_string).collect())
                .unwrap_or_default()
        }
    }

    #[test]
    fn test_locate_maps_directories_to_context_paths() {
        let fx = Fixture::new();
        let root = fx.watcher.webapps_dir();

        let source = fx.watcher.locate(&root.join("ROOT/app.json")).unwrap();
        assert_eq!(source.context_path, "/");
        assert_eq!(source.docroot, root.join("ROOT"));

        let source = fx.watcher.locate(&root.join("shop/app.json")).unwrap();
        assert_eq!(source.context_path, "/shop");

        assert!(fx.watcher.locate(&root.join("shop/readme.txt")).is_none());
        assert!(fx.watcher.locate(&root.join("shop/.app.json")).is_none());
        assert!(fx.watcher.locate(&root.join("top.json")).is_none());
        assert!(fx.watcher.locate(&root.join("shop/deep/app.json")).is_none());
    }

    #[test]
    fn test_scan_merges_in_file_name_order() {
        let fx = Fixture::new();
        fx.write("shop/10-more.json", r#"{"controllers": {"/b": "Health", "/a": "Other"}}"#);
        fx.write("shop/00-base.json", r#"{"controllers": {"/a": "Health"}}"#);
        fx.write("ROOT/app.json", r#"{"statics": {"/*": "public"}}"#);
        fx.write("shop/notes.txt", "not a definition");

        assert_eq!(fx.watcher.scan().unwrap(), 3);
        assert_eq!(fx.controllers("/shop"), vec!["/a", "/b"]);
        assert_eq!(
            fx.store.snapshot().get("/shop").unwrap().definition.controllers.get("/a"),
            Some("Other")
        );
        assert!(fx.store.snapshot().get("/").is_some());
    }

    #[test]
    fn test_rejected_file_keeps_previous_state() {
        let fx = Fixture::new();
        let file = fx.write("shop/app.json", r#"{"controllers": {"/a": "Health"}}"#);
        assert_eq!(fx.watcher.apply_file(&file), ReloadOutcome::Loaded);

        fs::write(&file, r#"{"controllers": {"/a": "#).unwrap();
        assert_eq!(fx.watcher.apply_file(&file), ReloadOutcome::Rejected);
        assert_eq!(fx.controllers("/shop"), vec!["/a"]);

        fs::write(&file, r#"{"controllers": {"^(": "Health"}}"#).unwrap();
        assert_eq!(fx.watcher.apply_file(&file), ReloadOutcome::Rejected);
        assert_eq!(fx.controllers("/shop"), vec!["/a"]);
    }

    #[test]
    fn test_empty_or_deleted_file_unloads_only_its_routes() {
        let fx = Fixture::new();
        let base = fx.write("shop/a.json", r#"{"controllers": {"/a": "Health"}}"#);
        let extra = fx.write("shop/b.json", r#"{"controllers": {"/b": "Health"}}"#);
        fx.watcher.scan().unwrap();

        fs::write(&extra, "{}").unwrap();
        assert_eq!(fx.watcher.apply_file(&extra), ReloadOutcome::Unloaded);
        assert_eq!(fx.controllers("/shop"), vec!["/a"]);

        fs::remove_file(&base).unwrap();
        assert_eq!(fx.watcher.apply(&base), vec![ReloadOutcome::Unloaded]);
        assert!(fx.store.snapshot().get("/shop").is_none());

        // Deleting an untracked file is a no-op
        fs::remove_file(&extra).unwrap();
        assert_eq!(fx.watcher.apply_file(&extra), ReloadOutcome::Ignored);
    }

    #[test]
    fn test_directory_removal_unloads_application() {
        let fx = Fixture::new();
        fx.write("shop/a.json", r#"{"controllers": {"/a": "Health"}}"#);
        fx.write("shop/b.json", r#"{"controllers": {"/b": "Health"}}"#);
        fx.write("blog/a.json", r#"{"controllers": {"/a": "Health"}}"#);
        fx.watcher.scan().unwrap();

        let shop = fx.watcher.webapps_dir().join("shop");
        fs::remove_dir_all(&shop).unwrap();
        assert_eq!(fx.watcher.apply(&shop).len(), 2);
        assert!(fx.store.snapshot().get("/shop").is_none());
        assert!(fx.store.snapshot().get("/blog").is_some());
    }

    #[test]
    fn test_rescan_drops_vanished_files() {
        let fx = Fixture::new();
        let file = fx.write("shop/a.json", r#"{"controllers": {"/a": "Health"}}"#);
        fx.watcher.scan().unwrap();

        fs::remove_file(&file).unwrap();
        fx.watcher.scan().unwrap();
        assert!(fx.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_watch_applies_changes() {
        let fx = Fixture::new();
        fx.watcher.scan().unwrap();

        let shutdown = GracefulShutdown::new();
        let handle = fx.watcher.clone().watch(shutdown.shutdown_token()).unwrap();

        fx.write("shop/app.json", r#"{"controllers": {"/live": "Health"}}"#);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fx.controllers("/shop").is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(fx.controllers("/shop"), vec!["/live"]);

        shutdown.trigger_shutdown(crate::utils::ShutdownReason::Graceful);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
