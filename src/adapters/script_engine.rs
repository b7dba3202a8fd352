//! Interpreted controllers on an embedded Rhai engine.
//!
//! Scripts see exactly six globals: `request`, `response`, `session`,
//! `console`, `tools` and `files`. Module imports and `eval` are disabled and
//! the configured operation and size limits apply to every evaluation.
//!
//! ```rhai
//! let name = request.param("name") ?? "world";
//! session.set("visits", (session.get("visits") ?? 0) + 1);
//! response.content_type("text/plain");
//! response.write(`hello ${name}`);
//! ```
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use rhai::{
    AST, Array, Dynamic, Engine, EvalAltResult, INT, Map, Position, Scope,
    module_resolvers::DummyModuleResolver,
    serde::{from_dynamic, to_dynamic},
};
use serde_json::Value;

use crate::{
    config::models::ScriptConfig,
    core::{
        controller::{ConsoleSink, ControllerFault, ControllerRequest, DocumentReader, ResponseHandle},
        session::SessionRecord,
        tools::ToolRegistry,
    },
    ports::script_engine::{FaultOrigin, ScriptBindings, ScriptEngine, ScriptError},
};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Records which binding raised the failure of the current evaluation.
#[derive(Clone, Default)]
struct FaultCell(Arc<Mutex<Option<FaultOrigin>>>);

impl FaultCell {
    fn raise<T>(&self, origin: FaultOrigin, message: impl Into<String>) -> RhaiResult<T> {
        *self.0.lock() = Some(origin);
        Err(message.into().into())
    }

    fn origin(&self) -> FaultOrigin {
        self.0.lock().unwrap_or(FaultOrigin::Script)
    }
}

fn to_script_value(value: &Value) -> RhaiResult<Dynamic> {
    to_dynamic(value)
}

fn from_script_value(value: &Dynamic) -> RhaiResult<Value> {
    from_dynamic::<Value>(value)
}

fn fault_to_script<T>(fault: ControllerFault) -> RhaiResult<T> {
    Err(fault.to_string().into())
}

#[derive(Clone)]
struct ScriptRequest {
    inner: Arc<ControllerRequest>,
    fault: FaultCell,
}

impl ScriptRequest {
    fn header(&mut self, name: &str) -> Dynamic {
        self.inner
            .header(name)
            .map(|v| Dynamic::from(v.to_string()))
            .unwrap_or(Dynamic::UNIT)
    }

    fn param(&mut self, name: &str) -> Dynamic {
        self.inner
            .param(name)
            .map(|v| Dynamic::from(v.to_string()))
            .unwrap_or(Dynamic::UNIT)
    }

    fn query(&mut self) -> Map {
        self.inner
            .query
            .iter()
            .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
            .collect()
    }

    fn body(&mut self) -> RhaiResult<Dynamic> {
        match to_script_value(&self.inner.body.to_value()) {
            Ok(value) => Ok(value),
            Err(e) => self.fault.raise(FaultOrigin::Body, e.to_string()),
        }
    }
}

#[derive(Clone)]
struct ScriptResponse {
    handle: ResponseHandle,
}

impl ScriptResponse {
    fn set_status(&mut self, code: INT) -> RhaiResult<()> {
        let status = u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or_else(|| format!("invalid status code {code}"))?;
        self.handle.lock().set_status(status);
        Ok(())
    }

    fn set_header(&mut self, name: &str, value: &str) -> RhaiResult<()> {
        self.handle
            .lock()
            .set_header(name, value)
            .or_else(fault_to_script)
    }

    fn json(&mut self, value: Dynamic) -> RhaiResult<()> {
        let value = from_script_value(&value)?;
        self.handle.lock().json(&value).or_else(fault_to_script)
    }
}

#[derive(Clone)]
struct ScriptSession {
    record: Arc<SessionRecord>,
}

impl ScriptSession {
    fn get(&mut self, name: &str) -> RhaiResult<Dynamic> {
        match self.record.get_attribute(name) {
            Some(value) => to_script_value(&value),
            None => Ok(Dynamic::UNIT),
        }
    }

    fn set(&mut self, name: &str, value: Dynamic) -> RhaiResult<()> {
        self.record.set_attribute(name, from_script_value(&value)?);
        Ok(())
    }
}

#[derive(Clone)]
struct ScriptTools {
    registry: Arc<ToolRegistry>,
    fault: FaultCell,
}

impl ScriptTools {
    fn call(&mut self, tool: &str, operation: &str, args: Array) -> RhaiResult<Dynamic> {
        let args = args
            .iter()
            .map(from_script_value)
            .collect::<RhaiResult<Vec<Value>>>()?;
        match self.registry.invoke(tool, operation, &args) {
            Ok(value) => to_script_value(&value),
            Err(e) => self.fault.raise(FaultOrigin::Query, e.to_string()),
        }
    }
}

#[derive(Clone)]
struct ScriptFiles {
    reader: DocumentReader,
    fault: FaultCell,
}

impl ScriptFiles {
    fn read(&mut self, path: &str) -> RhaiResult<String> {
        match self.reader.read_to_string(path) {
            Ok(text) => Ok(text),
            Err(e) => self.fault.raise(FaultOrigin::View, e.to_string()),
        }
    }
}

fn register_bindings(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptRequest>("Request")
        .register_get("method", |r: &mut ScriptRequest| r.inner.method.to_string())
        .register_get("path", |r: &mut ScriptRequest| r.inner.path.local_path.clone())
        .register_get("raw_path", |r: &mut ScriptRequest| r.inner.path.raw_path.clone())
        .register_get("context_path", |r: &mut ScriptRequest| {
            r.inner.path.context_path.clone()
        })
        .register_get("remote_addr", |r: &mut ScriptRequest| {
            r.inner
                .remote_addr
                .map(|a| Dynamic::from(a.to_string()))
                .unwrap_or(Dynamic::UNIT)
        })
        .register_get("query", ScriptRequest::query)
        .register_fn("body", ScriptRequest::body)
        .register_fn("header", ScriptRequest::header)
        .register_fn("param", ScriptRequest::param);

    engine
        .register_type_with_name::<ScriptResponse>("Response")
        .register_get("status", |r: &mut ScriptResponse| {
            r.handle.lock().status().as_u16() as INT
        })
        .register_fn("set_status", ScriptResponse::set_status)
        .register_fn("set_header", ScriptResponse::set_header)
        .register_fn("content_type", |r: &mut ScriptResponse, value: &str| {
            r.set_header("content-type", value)
        })
        .register_fn("write", |r: &mut ScriptResponse, text: &str| {
            r.handle.lock().write_str(text)
        })
        .register_fn("json", ScriptResponse::json)
        .register_fn("redirect", |r: &mut ScriptResponse, location: &str| {
            r.handle.lock().redirect(location).or_else(fault_to_script)
        });

    engine
        .register_type_with_name::<ScriptSession>("Session")
        .register_get("id", |s: &mut ScriptSession| s.record.id().to_string())
        .register_fn("get", ScriptSession::get)
        .register_fn("set", ScriptSession::set)
        .register_fn("remove", |s: &mut ScriptSession, name: &str| {
            s.record.remove_attribute(name);
        })
        .register_fn("names", |s: &mut ScriptSession| {
            s.record
                .attribute_names()
                .into_iter()
                .map(Dynamic::from)
                .collect::<Array>()
        })
        .register_fn("invalidate", |s: &mut ScriptSession| s.record.invalidate());

    engine
        .register_type_with_name::<ConsoleSink>("Console")
        .register_fn("log", |c: &mut ConsoleSink, message: &str| c.log(message))
        .register_fn("warn", |c: &mut ConsoleSink, message: &str| c.warn(message))
        .register_fn("error", |c: &mut ConsoleSink, message: &str| c.error(message));

    engine
        .register_type_with_name::<ScriptTools>("Tools")
        .register_fn("call", ScriptTools::call)
        .register_fn("call", |t: &mut ScriptTools, tool: &str, operation: &str| {
            t.call(tool, operation, Array::new())
        })
        .register_fn("names", |t: &mut ScriptTools| {
            t.registry
                .names()
                .into_iter()
                .map(|n| Dynamic::from(n.to_string()))
                .collect::<Array>()
        });

    engine
        .register_type_with_name::<ScriptFiles>("Files")
        .register_fn("read", ScriptFiles::read)
        .register_fn("exists", |f: &mut ScriptFiles, path: &str| f.reader.exists(path));
}

struct CachedScript {
    modified: Option<SystemTime>,
    ast: Arc<AST>,
}

/// [`ScriptEngine`] backed by a single shared Rhai [`Engine`].
pub struct RhaiScriptEngine {
    engine: Engine,
    cache: RwLock<HashMap<PathBuf, CachedScript>>,
}

impl RhaiScriptEngine {
    pub fn new(config: &ScriptConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.on_print(|text| tracing::info!(target: "atrium::script", "{text}"));
        engine.on_debug(|text, source, pos: Position| {
            tracing::debug!(target: "atrium::script", source, position = %pos, "{text}")
        });
        register_bindings(&mut engine);

        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Number of compiled scripts held in the cache.
    pub fn cached_scripts(&self) -> usize {
        self.cache.read().len()
    }

    fn compiled(&self, script: &Path) -> Result<Arc<AST>, ScriptError> {
        let metadata = match std::fs::metadata(script) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(ScriptError::NotFound(script.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScriptError::NotFound(script.display().to_string()));
            }
            Err(e) => {
                return Err(ScriptError::Io {
                    path: script.display().to_string(),
                    message: e.to_string(),
                });
            }
        };
        let modified = metadata.modified().ok();

        if modified.is_some() {
            if let Some(cached) = self.cache.read().get(script) {
                if cached.modified == modified {
                    return Ok(cached.ast.clone());
                }
            }
        }

        let source = std::fs::read_to_string(script).map_err(|e| ScriptError::Io {
            path: script.display().to_string(),
            message: e.to_string(),
        })?;
        let ast = self
            .engine
            .compile(&source)
            .map_err(|e| ScriptError::Compile {
                path: script.display().to_string(),
                message: e.to_string(),
            })?;
        let ast = Arc::new(ast);

        tracing::debug!(script = %script.display(), "Compiled script");
        self.cache.write().insert(
            script.to_path_buf(),
            CachedScript {
                modified,
                ast: ast.clone(),
            },
        );
        Ok(ast)
    }
}

impl ScriptEngine for RhaiScriptEngine {
    fn evaluate(&self, script: &Path, bindings: ScriptBindings) -> Result<(), ScriptError> {
        let ast = self.compiled(script)?;
        let fault = FaultCell::default();

        let mut scope = Scope::new();
        scope.push(
            "request",
            ScriptRequest {
                inner: bindings.request,
                fault: fault.clone(),
            },
        );
        scope.push(
            "response",
            ScriptResponse {
                handle: bindings.response,
            },
        );
        scope.push(
            "session",
            ScriptSession {
                record: bindings.session,
            },
        );
        scope.push("console", bindings.console);
        scope.push_dynamic("user", bindings.user.map_or(Dynamic::UNIT, Dynamic::from));
        scope.push(
            "tools",
            ScriptTools {
                registry: bindings.tools,
                fault: fault.clone(),
            },
        );
        scope.push(
            "files",
            ScriptFiles {
                reader: bindings.files,
                fault: fault.clone(),
            },
        );

        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| ScriptError::Runtime {
                path: script.display().to_string(),
                origin: fault.origin(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method, Uri};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::core::{controller::ControllerFault, file_path::FilePath};

    struct Fixture {
        dir: TempDir,
        engine: RhaiScriptEngine,
        response: ResponseHandle,
        session: Arc<SessionRecord>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                engine: RhaiScriptEngine::new(&ScriptConfig::default()),
                response: ResponseHandle::new(),
                session: Arc::new(SessionRecord::new("s-1")),
            }
        }

        fn script(&self, name: &str, source: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, source).unwrap();
            path
        }

        fn run(&self, script: &Path, uri: &str) -> Result<(), ScriptError> {
            let uri: Uri = uri.parse().unwrap();
            let path = FilePath::new(uri.path(), "/app").unwrap();
            let request = ControllerRequest::new(Method::GET, uri, HeaderMap::new(), path);
            let mut tools = ToolRegistry::new();
            tools.register(
                "site",
                Arc::new(crate::core::tools::ConfiguredTool::new("site", json!({"title": "Demo"}))),
            );
            self.engine.evaluate(
                script,
                ScriptBindings {
                    request: Arc::new(request),
                    response: self.response.clone(),
                    session: self.session.clone(),
                    tools: Arc::new(tools),
                    files: DocumentReader::new(self.dir.path()),
                    console: ConsoleSink::new("/app"),
                    user: None,
                },
            )
        }
    }

    #[test]
    fn test_script_writes_response_and_session() {
        let fx = Fixture::new();
        let script = fx.script(
            "hello.rhai",
            r#"
                let name = request.param("name") ?? "world";
                session.set("visits", 1);
                response.content_type("text/plain");
                response.set_status(201);
                response.write(`hello ${name} from ${request.path}`);
            "#,
        );
        fx.run(&script, "/app/hello?name=ada").unwrap();

        let response = fx.response.take();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.content_type(), Some("text/plain"));
        assert_eq!(response.body(), b"hello ada from /hello");
        assert_eq!(fx.session.get_attribute("visits"), Some(json!(1)));
    }

    #[test]
    fn test_tools_and_files_bindings() {
        let fx = Fixture::new();
        fx.script("header.html", "<h1>");
        let script = fx.script(
            "page.rhai",
            r#"
                let site = tools.call("site", "get");
                response.write(files.read("header.html") + site.title);
            "#,
        );
        fx.run(&script, "/app/page").unwrap();
        assert_eq!(fx.response.take().body(), b"<h1>Demo");
    }

    #[test]
    fn test_fault_classification() {
        let fx = Fixture::new();

        let script = fx.script("view.rhai", r#"files.read("../../etc/passwd");"#);
        let err = fx.run(&script, "/app/view").unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { origin: FaultOrigin::View, .. }));

        let script = fx.script("query.rhai", r#"tools.call("missing", "get");"#);
        let err = fx.run(&script, "/app/query").unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { origin: FaultOrigin::Query, .. }));

        let script = fx.script("boom.rhai", r#"throw "boom";"#);
        let err = fx.run(&script, "/app/boom").unwrap_err();
        assert!(matches!(
            ControllerFault::from(err),
            ControllerFault::Script(_)
        ));
    }

    #[test]
    fn test_sandbox_limits() {
        let fx = Fixture::new();

        let script = fx.script("loop.rhai", "loop { }");
        assert!(matches!(
            fx.run(&script, "/app/loop"),
            Err(ScriptError::Runtime { .. })
        ));

        let script = fx.script("import.rhai", r#"import "os" as os;"#);
        assert!(fx.run(&script, "/app/import").is_err());

        let script = fx.script("eval.rhai", r#"eval("1 + 1");"#);
        assert!(fx.run(&script, "/app/eval").is_err());
    }

    #[test]
    fn test_compile_and_missing_errors() {
        let fx = Fixture::new();
        let script = fx.script("broken.rhai", "let = ;");
        assert!(matches!(
            fx.run(&script, "/app/broken"),
            Err(ScriptError::Compile { .. })
        ));
        assert!(matches!(
            fx.run(&fx.dir.path().join("none.rhai"), "/app/none"),
            Err(ScriptError::NotFound(_))
        ));
    }

    #[test]
    fn test_cache_reused_until_file_changes() {
        let fx = Fixture::new();
        let script = fx.script("count.rhai", r#"response.write("one");"#);
        fx.run(&script, "/app/count").unwrap();
        fx.run(&script, "/app/count").unwrap();
        assert_eq!(fx.engine.cached_scripts(), 1);
        assert_eq!(fx.response.take().body(), b"oneone");

        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&script, r#"response.write("two");"#).unwrap();
        let file = std::fs::File::options().write(true).open(&script).unwrap();
        file.set_modified(SystemTime::now() + std::time::Duration::from_secs(5))
            .unwrap();

        fx.run(&script, "/app/count").unwrap();
        assert_eq!(fx.response.take().body(), b"two");
    }
}
