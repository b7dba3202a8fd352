//! Uniform invocation of compiled and interpreted controllers.
use std::{fmt, path::PathBuf, sync::Arc};

use http::header::CACHE_CONTROL;

use crate::{
    core::controller::{Controller, ControllerContext, ControllerFault},
    ports::script_engine::ScriptEngine,
};

/// What a controller route resolved to.
#[derive(Clone)]
pub enum ControllerTarget {
    /// An instance built from the registry when the context was built
    Compiled {
        spec: String,
        controller: Arc<dyn Controller>,
    },
    /// A script file under the application's document root
    Script(PathBuf),
}

impl fmt::Debug for ControllerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerTarget::Compiled { spec, .. } => f.debug_tuple("Compiled").field(spec).finish(),
            ControllerTarget::Script(path) => f.debug_tuple("Script").field(path).finish(),
        }
    }
}

impl ControllerTarget {
    pub fn describe(&self) -> String {
        match self {
            ControllerTarget::Compiled { spec, .. } => spec.clone(),
            ControllerTarget::Script(path) => path.display().to_string(),
        }
    }
}

pub struct ControllerInvoker {
    scripts: Arc<dyn ScriptEngine>,
}

impl ControllerInvoker {
    pub fn new(scripts: Arc<dyn ScriptEngine>) -> Self {
        Self { scripts }
    }

    /// Run `target` against `ctx`. Dynamic responses are marked `no-store`
    /// before the controller runs so a controller may still override it.
    pub async fn invoke(
        &self,
        target: &ControllerTarget,
        ctx: &ControllerContext,
    ) -> Result<(), ControllerFault> {
        ctx.response
            .lock()
            .set_header(CACHE_CONTROL.as_str(), "no-store")?;

        match target {
            ControllerTarget::Compiled { controller, .. } => controller.handle(ctx).await,
            ControllerTarget::Script(path) => {
                let engine = self.scripts.clone();
                let path = path.clone();
                let bindings = ctx.script_bindings();
                tokio::task::spawn_blocking(move || engine.evaluate(&path, bindings))
                    .await
                    .map_err(|e| eyre::eyre!("Script task aborted: {e}"))?
                    .map_err(ControllerFault::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        core::controller::tests::{Echo, test_context},
        ports::script_engine::{FaultOrigin, ScriptBindings, ScriptError},
    };

    struct FailingScripts;

    impl ScriptEngine for FailingScripts {
        fn evaluate(&self, script: &Path, bindings: ScriptBindings) -> Result<(), ScriptError> {
            bindings.response.lock().write_str("partial");
            Err(ScriptError::Runtime {
                path: script.display().to_string(),
                origin: FaultOrigin::Script,
                message: "undefined variable".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_compiled_target_runs_with_no_store() {
        let invoker = ControllerInvoker::new(Arc::new(FailingScripts));
        let target = ControllerTarget::Compiled {
            spec: "Echo".into(),
            controller: Arc::new(Echo {
                prefix: "",
                body: "hello",
            }),
        };
        let ctx = test_context("/app/x", "/app");
        invoker.invoke(&target, &ctx).await.unwrap();

        let response = ctx.response.take();
        assert_eq!(response.header("cache-control"), Some("no-store"));
        assert_eq!(response.body(), b"hello");
    }

    #[tokio::test]
    async fn test_script_failure_becomes_script_fault() {
        let invoker = ControllerInvoker::new(Arc::new(FailingScripts));
        let target = ControllerTarget::Script(PathBuf::from("/srv/app/index.rhai"));
        let ctx = test_context("/app/", "/app");

        let fault = invoker.invoke(&target, &ctx).await.unwrap_err();
        assert!(matches!(fault, ControllerFault::Script(_)));
        assert_eq!(ctx.response.lock().header("cache-control"), Some("no-store"));
    }
}
