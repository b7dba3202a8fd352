//! File → definition bookkeeping and per-application aggregates.
//!
//! The store is the single source of truth for "what is configured right
//! now". Every definition file is tracked individually so that unloading a
//! file removes exactly its contribution; after each change the aggregate of
//! the affected application is rebuilt from the files that remain and a new
//! immutable [`DefinitionSnapshot`] is published.
//!
//! Writers (the config watcher) serialize on the file table's write lock.
//! Readers (request tasks) only ever load the published snapshot, so they
//! never observe a half-applied change and never wait on a writer.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::{
    core::{definition::WebappDefinition, file_path::belongs_to},
    ports::definition_sink::DefinitionSink,
};

/// Where a definition file sits in the application layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionSource {
    pub file: PathBuf,
    pub context_path: String,
    /// Document root of the application the file belongs to
    pub docroot: PathBuf,
}

#[derive(Debug)]
struct FileEntry {
    source: DefinitionSource,
    definition: WebappDefinition,
}

/// The merged definition of one application at one point in time.
///
/// Identity matters: a new `Arc<AggregateDefinition>` is published whenever
/// any of the application's files changes, and consumers compare by pointer.
#[derive(Debug)]
pub struct AggregateDefinition {
    pub context_path: String,
    pub docroot: PathBuf,
    pub definition: WebappDefinition,
    pub generation: u64,
    pub files: Vec<PathBuf>,
}

/// Immutable view of every configured application.
#[derive(Debug, Default)]
pub struct DefinitionSnapshot {
    applications: BTreeMap<String, Arc<AggregateDefinition>>,
}

impl DefinitionSnapshot {
    pub fn get(&self, context_path: &str) -> Option<Arc<AggregateDefinition>> {
        self.applications.get(context_path).cloned()
    }

    /// The application owning `path`: longest matching context path wins.
    pub fn locate(&self, path: &str) -> Option<Arc<AggregateDefinition>> {
        self.applications
            .iter()
            .filter(|(context_path, _)| belongs_to(path, context_path))
            .max_by_key(|(context_path, _)| context_path.len())
            .map(|(_, aggregate)| aggregate.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AggregateDefinition>> {
        self.applications.values()
    }

    pub fn context_paths(&self) -> impl Iterator<Item = &str> {
        self.applications.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

/// Tracks every loaded definition file and publishes aggregate snapshots.
pub struct DefinitionStore {
    files: RwLock<BTreeMap<PathBuf, FileEntry>>,
    snapshot: ArcSwap<DefinitionSnapshot>,
    generation: AtomicU64,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            snapshot: ArcSwap::from_pointee(DefinitionSnapshot::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> Arc<DefinitionSnapshot> {
        self.snapshot.load_full()
    }

    /// Paths of every file currently contributing to some application.
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        self.files.read().keys().cloned().collect()
    }

    /// Add or replace one file's contribution. An empty definition is
    /// treated as the file being deleted.
    pub fn load(&self, source: DefinitionSource, definition: WebappDefinition) {
        if definition.is_empty() {
            self.unload(&source.file);
            return;
        }

        let mut files = self.files.write();
        let context_path = source.context_path.clone();
        let previous = files.insert(source.file.clone(), FileEntry { source, definition });

        if let Some(previous) = previous {
            // A file moved between applications: rebuild the one it left too.
            if previous.source.context_path != context_path {
                self.publish(&files, &previous.source.context_path);
            }
        }
        self.publish(&files, &context_path);
    }

    /// Remove one file's contribution; a no-op for untracked files.
    pub fn unload(&self, file: &Path) {
        let mut files = self.files.write();
        if let Some(entry) = files.remove(file) {
            self.publish(&files, &entry.source.context_path);
        }
    }

    /// Rebuild the aggregate of `context_path` and swap in a new snapshot.
    /// Must be called with the file table write lock held.
    fn publish(&self, files: &BTreeMap<PathBuf, FileEntry>, context_path: &str) {
        let contributors: Vec<&FileEntry> = files
            .values()
            .filter(|entry| entry.source.context_path == context_path)
            .collect();

        let current = self.snapshot.load();
        let mut applications = current.applications.clone();

        match contributors.first() {
            None => {
                applications.remove(context_path);
                tracing::info!(context_path, "Application definition removed");
            }
            Some(first) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let definition =
                    WebappDefinition::build(contributors.iter().map(|entry| &entry.definition));
                let aggregate = AggregateDefinition {
                    context_path: context_path.to_string(),
                    docroot: first.source.docroot.clone(),
                    definition,
                    generation,
                    files: contributors.iter().map(|e| e.source.file.clone()).collect(),
                };
                tracing::info!(
                    context_path,
                    generation,
                    files = aggregate.files.len(),
                    controllers = aggregate.definition.controllers.len(),
                    statics = aggregate.definition.statics.len(),
                    "Application definition published"
                );
                applications.insert(context_path.to_string(), Arc::new(aggregate));
            }
        }

        self.snapshot
            .store(Arc::new(DefinitionSnapshot { applications }));
    }
}

impl Default for DefinitionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionSink for DefinitionStore {
    fn load(&self, source: DefinitionSource, definition: WebappDefinition) {
        DefinitionStore::load(self, source, definition);
    }

    fn unload(&self, file: &Path) {
        DefinitionStore::unload(self, file);
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        DefinitionStore::tracked_files(self)
    }
}
