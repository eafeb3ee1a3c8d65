//! The embedded-scripting bridge.
//!
//! Script-authored filters run in Rhai. Every invocation gets a fresh,
//! isolated engine: host bindings are installed, the script's `filter_exec`
//! runs, and the engine is dropped. Nothing persists between runs except
//! what goes through the request scope store.

use crate::error::{FilterError, PluginLoadError};
use crate::plugin::api::{
    ExecContext, Filter, FilterConfig, FilterOutcome, InvokePoint, Operation, ScriptCapability,
};
use crate::scope::RequestScope;
use rhai::{Dynamic, Engine, Scope, AST};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Function a script must define to describe itself.
const CONFIG_FN: &str = "filter_config";
/// Function invoked per request with `(ctx, body)`.
const EXEC_FN: &str = "filter_exec";

pub struct ScriptBridge;

impl ScriptBridge {
    /// Build the per-run scripting context: a limited engine with the
    /// built-in request-scope bindings plus every registered capability
    /// bound under its name. The context lives exactly one invocation.
    pub fn context(
        scope: &Arc<RequestScope>,
        capabilities: &[Arc<dyn ScriptCapability>],
    ) -> Engine {
        let mut engine = limited_engine();

        let s = scope.clone();
        engine.register_fn("scope_get", move |key: &str| {
            s.get(key).unwrap_or_default()
        });

        let s = scope.clone();
        engine.register_fn("scope_set", move |key: &str, value: &str| {
            s.set(key, value);
        });

        let s = scope.clone();
        engine.register_fn("scope_list", move || {
            let mut map = rhai::Map::new();
            for (k, v) in s.list() {
                map.insert(k.into(), Dynamic::from(v));
            }
            map
        });

        engine.register_fn("log", |msg: &str| {
            tracing::info!(target: "script_filter", "{}", msg);
        });

        for capability in capabilities {
            capability.bind(scope, &mut engine);
        }

        engine
    }
}

/// Engine with safety limits; a runaway script trips the operation cap
/// instead of stalling the request forever.
fn limited_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 32);
    engine.set_max_operations(200_000);
    engine.set_max_string_size(1_048_576);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);
    engine
}

/// A filter authored as a Rhai script.
#[derive(Debug)]
pub struct ScriptFilter {
    config: FilterConfig,
    ast: AST,
    path: PathBuf,
}

impl ScriptFilter {
    pub fn load(path: &Path) -> Result<Self, PluginLoadError> {
        let source =
            std::fs::read_to_string(path).map_err(|e| PluginLoadError::ScriptCompile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_source(path, &source)
    }

    pub fn from_source(path: &Path, source: &str) -> Result<Self, PluginLoadError> {
        let engine = limited_engine();
        let ast = engine
            .compile(source)
            .map_err(|e| PluginLoadError::ScriptCompile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let declared: rhai::Map = engine
            .call_fn(&mut Scope::new(), &ast, CONFIG_FN, ())
            .map_err(|e| PluginLoadError::ScriptConfig {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let config = parse_config(path, &declared)?;

        Ok(Self {
            config,
            ast,
            path: path.to_path_buf(),
        })
    }
}

impl Filter for ScriptFilter {
    fn config(&self) -> FilterConfig {
        self.config.clone()
    }

    fn exec(&self, ctx: &ExecContext<'_>, body: &str) -> Result<FilterOutcome, FilterError> {
        let engine = ScriptBridge::context(ctx.scope, ctx.script_capabilities);

        let mut call_ctx = rhai::Map::new();
        call_ctx.insert("method".into(), Dynamic::from(ctx.scope.method.clone()));
        call_ctx.insert("path".into(), Dynamic::from(ctx.scope.path.clone()));
        call_ctx.insert(
            "request_id".into(),
            Dynamic::from(ctx.scope.request_id.clone()),
        );

        let result: rhai::Map = engine
            .call_fn(
                &mut Scope::new(),
                &self.ast,
                EXEC_FN,
                (Dynamic::from(call_ctx), body.to_string()),
            )
            .map_err(|e| {
                FilterError::new(
                    &self.config.name,
                    format!("{} ({})", e, self.path.display()),
                )
            })?;

        let status = map_int(&result, "status").map(|s| s as u16);

        if let Some(message) = map_str(&result, "error") {
            let mut err = FilterError::new(&self.config.name, message);
            err.status = status;
            err.body = map_str(&result, "body");
            return Err(err);
        }

        let next = result
            .get("next")
            .and_then(|d| d.as_bool().ok())
            .unwrap_or(true);
        let body = map_str(&result, "body").unwrap_or_else(|| body.to_string());
        let operation = match map_str(&result, "operation").as_deref() {
            Some("write") => Operation::Write,
            _ => Operation::Read,
        };

        Ok(FilterOutcome {
            next,
            body,
            status,
            operation,
        })
    }
}

fn parse_config(path: &Path, map: &rhai::Map) -> Result<FilterConfig, PluginLoadError> {
    let name = map_str(map, "name").ok_or_else(|| PluginLoadError::ScriptConfig {
        path: path.display().to_string(),
        reason: "missing required field `name`".into(),
    })?;

    let invoke_point = match map_str(map, "invoke").as_deref() {
        None | Some("request") => InvokePoint::Request,
        Some("response") => InvokePoint::Response,
        Some(other) => {
            return Err(PluginLoadError::ScriptConfig {
                path: path.display().to_string(),
                reason: format!("unknown invoke point `{other}`"),
            })
        }
    };

    Ok(FilterConfig {
        name,
        order: map_int(map, "order").unwrap_or(0) as i32,
        path_pattern: map_str(map, "path_pattern").unwrap_or_else(|| ".*".to_string()),
        invoke_point,
    })
}

fn map_str(map: &rhai::Map, key: &str) -> Option<String> {
    map.get(key).and_then(|d| d.clone().into_string().ok())
}

fn map_int(map: &rhai::Map, key: &str) -> Option<i64> {
    map.get(key).and_then(|d| d.as_int().ok())
}
