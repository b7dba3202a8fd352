//! Context path → live [`ApplicationContext`].
//!
//! Lookups probe under a shared lock and return immediately when the live
//! context was built from the aggregate currently published for its path.
//! Otherwise the caller takes the build lock, re-reads the published aggregate,
//! probes again (someone else may have built it meanwhile) and only then
//! builds. A slot never moves back to an older generation. Construction happens outside
//! the slot lock, so readers are blocked only for the pointer swap.
use std::{collections::HashMap, path::PathBuf, sync::Arc};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::{
    core::{
        application::{ApplicationContext, ContextError, ContextFactory},
        definitions::{AggregateDefinition, DefinitionStore},
        error::RouteError,
        file_path::FilePath,
        session::{SessionIndex, SessionRecord},
    },
    metrics,
};

#[derive(Default)]
struct ContextSlot {
    current: Option<Arc<ApplicationContext>>,
    /// Aggregate whose build failed, with the failure; cleared on success
    rejected: Option<(Arc<AggregateDefinition>, ContextError)>,
}

/// Status view of one configured application.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSummary {
    pub context_path: String,
    pub docroot: PathBuf,
    pub generation: u64,
    pub files: Vec<PathBuf>,
    /// Generation of the context currently serving requests, if any
    pub live_generation: Option<u64>,
    pub sessions: usize,
}

pub struct ApplicationRegistry {
    definitions: Arc<DefinitionStore>,
    factory: ContextFactory,
    slots: RwLock<HashMap<String, ContextSlot>>,
    build_lock: Mutex<()>,
    sessions: SessionIndex<ApplicationContext>,
}

impl ApplicationRegistry {
    pub fn new(definitions: Arc<DefinitionStore>, factory: ContextFactory) -> Self {
        Self {
            definitions,
            factory,
            slots: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            sessions: SessionIndex::new(),
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.definitions
    }

    /// The up-to-date context for `context_path`, or `None` when no
    /// application is configured there.
    pub fn resolve(
        &self,
        context_path: &str,
    ) -> Result<Option<Arc<ApplicationContext>>, ContextError> {
        match self.definitions.snapshot().get(context_path) {
            Some(aggregate) => self.context_for(aggregate),
            None => Ok(None),
        }
    }

    /// Find the application owning `raw_path` and split the path under it.
    pub fn locate(
        &self,
        raw_path: &str,
    ) -> Result<(Arc<ApplicationContext>, FilePath), RouteError> {
        let not_found = || RouteError::NotFound {
            path: raw_path.to_string(),
        };
        let aggregate = self.definitions.snapshot().locate(raw_path).ok_or_else(not_found)?;
        let context = self.context_for(aggregate)?.ok_or_else(not_found)?;
        let path = FilePath::new(raw_path, context.context_path()).ok_or_else(not_found)?;
        Ok((context, path))
    }

    /// A context at least as new as `aggregate`, if one is already settled.
    fn probe(
        &self,
        aggregate: &Arc<AggregateDefinition>,
    ) -> Result<Option<Arc<ApplicationContext>>, ContextError> {
        let slots = self.slots.read();
        let Some(slot) = slots.get(&aggregate.context_path) else {
            return Ok(None);
        };
        if let Some(current) = &slot.current {
            if current.is_built_from(aggregate) || current.generation() >= aggregate.generation {
                return Ok(Some(current.clone()));
            }
        }
        match &slot.rejected {
            Some((rejected, error)) if rejected.generation >= aggregate.generation => {
                match &slot.current {
                    Some(previous) => Ok(Some(previous.clone())),
                    None => Err(error.clone()),
                }
            }
            _ => Ok(None),
        }
    }

    /// `None` when the application was removed before it could be built.
    fn context_for(
        &self,
        aggregate: Arc<AggregateDefinition>,
    ) -> Result<Option<Arc<ApplicationContext>>, ContextError> {
        if let Some(found) = self.probe(&aggregate)? {
            return Ok(Some(found));
        }

        let _building = self.build_lock.lock();
        // The caller's aggregate may be stale by now; only the published one is built.
        let Some(aggregate) = self.definitions.snapshot().get(&aggregate.context_path) else {
            return Ok(None);
        };
        if let Some(found) = self.probe(&aggregate)? {
            return Ok(Some(found));
        }

        let context_path = aggregate.context_path.clone();
        match self.factory.build(aggregate.clone()) {
            Ok(context) => {
                let context = Arc::new(context);
                let previous = {
                    let mut slots = self.slots.write();
                    let slot = slots.entry(context_path.clone()).or_default();
                    slot.rejected = None;
                    slot.current.replace(context.clone())
                };
                context.notify_initialized();
                metrics::set_application_generation(&context_path, aggregate.generation);
                tracing::info!(
                    context_path = %context_path,
                    generation = aggregate.generation,
                    superseded = previous.as_ref().map(|p| p.generation()),
                    "Application context published"
                );
                // Retired contexts drain once requests and sessions let go.
                drop(previous);
                Ok(Some(context))
            }
            Err(error) => {
                let mut slots = self.slots.write();
                let slot = slots.entry(context_path.clone()).or_default();
                slot.rejected = Some((aggregate.clone(), error.clone()));
                match &slot.current {
                    Some(previous) => {
                        tracing::error!(
                            context_path = %context_path,
                            generation = aggregate.generation,
                            kept_generation = previous.generation(),
                            error = %error,
                            "Application context build failed, keeping previous context"
                        );
                        Ok(Some(previous.clone()))
                    }
                    None => {
                        tracing::error!(
                            context_path = %context_path,
                            generation = aggregate.generation,
                            error = %error,
                            "Application context build failed"
                        );
                        Err(error)
                    }
                }
            }
        }
    }

    /// Bring every slot in line with the published definitions: build
    /// contexts for new or changed aggregates and retire removed ones.
    pub fn refresh(&self) -> Vec<ContextError> {
        let snapshot = self.definitions.snapshot();

        let removed: Vec<String> = self
            .slots
            .read()
            .keys()
            .filter(|path| snapshot.get(path).is_none())
            .cloned()
            .collect();
        for context_path in removed {
            self.retire(&context_path);
        }

        snapshot
            .iter()
            .filter_map(|aggregate| self.context_for(aggregate.clone()).err())
            .collect()
    }

    fn retire(&self, context_path: &str) {
        let _building = self.build_lock.lock();
        let retired = self.slots.write().remove(context_path);
        if let Some(ContextSlot {
            current: Some(context),
            ..
        }) = retired
        {
            tracing::info!(
                context_path,
                generation = context.generation(),
                "Application context retired"
            );
        }
    }

    /// The session record for `id` as seen by `context`.
    ///
    /// A record created under an earlier context of the same application is
    /// carried over rather than replaced.
    pub async fn session_for(
        &self,
        context: &Arc<ApplicationContext>,
        id: &str,
    ) -> Arc<SessionRecord> {
        if let Some(record) = context.session(id).await {
            return record;
        }

        let mut carried = None;
        for holder in self.sessions.holders(id).await {
            if Arc::ptr_eq(&holder, context) || holder.context_path() != context.context_path() {
                continue;
            }
            if let Some(record) = holder.session(id).await {
                carried = Some(record);
                break;
            }
        }

        // Index the holder before the record exists so a concurrent
        // invalidation either sees this context or has already run.
        self.sessions.record(id, context).await;
        let record = match carried {
            Some(record) => context.adopt_session(record).await,
            None => context.open_session(id).await,
        };
        if !self.sessions.holds(id, context).await {
            // Invalidated between indexing and opening; the record must not outlive it
            context.invalidate_session(id).await;
        }
        metrics::set_active_sessions(self.sessions.len());
        record
    }

    /// Invalidate `id` in every context, live or retired, that holds it.
    /// Returns the number of contexts that dropped a record.
    pub async fn invalidate_session(&self, id: &str) -> usize {
        let mut cleared = 0;
        for holder in self.sessions.take(id).await {
            if holder.invalidate_session(id).await {
                cleared += 1;
            }
        }
        metrics::set_active_sessions(self.sessions.len());
        tracing::debug!(session_id = id, contexts = cleared, "Session invalidated");
        cleared
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn applications(&self) -> Vec<ApplicationSummary> {
        let snapshot = self.definitions.snapshot();
        let slots = self.slots.read();
        snapshot
            .iter()
            .map(|aggregate| {
                let live = slots
                    .get(&aggregate.context_path)
                    .and_then(|slot| slot.current.as_ref());
                ApplicationSummary {
                    context_path: aggregate.context_path.clone(),
                    docroot: aggregate.docroot.clone(),
                    generation: aggregate.generation,
                    files: aggregate.files.clone(),
                    live_generation: live.map(|c| c.generation()),
                    sessions: live.map(|c| c.session_count()).unwrap_or(0),
                }
            })
            .collect()
    }
}
