use std::path::{Path, PathBuf};

use crate::core::{definition::WebappDefinition, definitions::DefinitionSource};

/// DefinitionSink is the port a definition source (directory watcher, test
/// harness, embedding application) feeds parsed definition files into.
///
/// Implementations must apply each call atomically: readers either see the
/// state before the call or after it.
pub trait DefinitionSink: Send + Sync + 'static {
    /// Add or replace the contribution of one file.
    fn load(&self, source: DefinitionSource, definition: WebappDefinition);

    /// Remove the contribution of one file. Unknown files are ignored.
    fn unload(&self, file: &Path);

    /// Files currently contributing to some application.
    fn tracked_files(&self) -> Vec<PathBuf>;
}
