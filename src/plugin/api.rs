//! Capability contracts implemented by plugin modules.

use crate::error::FilterError;
use crate::scope::RequestScope;
use std::sync::Arc;

/// Entry symbol every native module must export:
/// `#[no_mangle] fn bridle_plugin() -> Box<dyn PluginModule>`.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"bridle_plugin";

/// Signature of the entry symbol.
pub type PluginEntry = unsafe extern "Rust" fn() -> Box<dyn PluginModule>;

/// Processing stage at which a filter fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokePoint {
    Request,
    Response,
}

impl InvokePoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvokePoint::Request => "request",
            InvokePoint::Response => "response",
        }
    }
}

/// Diagnostic tag a filter attaches to its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

/// Static description of a filter: chain position and applicability.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub name: String,
    /// Ascending precedence; ties resolve by discovery order.
    pub order: i32,
    /// Regex matched against the request path.
    pub path_pattern: String,
    pub invoke_point: InvokePoint,
}

/// Result of one filter invocation. Carries no telemetry fields; the chain
/// reports invocations to the metrics side channel itself.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Continue to the next matching filter?
    pub next: bool,
    /// Possibly rewritten body, fed to the next filter or the backend.
    pub body: String,
    /// Optional status override; becomes the response when the chain halts.
    pub status: Option<u16>,
    pub operation: Operation,
}

impl FilterOutcome {
    /// Pass the (possibly rewritten) body on to the next filter.
    pub fn next(body: impl Into<String>) -> Self {
        Self {
            next: true,
            body: body.into(),
            status: None,
            operation: Operation::Read,
        }
    }

    /// Stop the chain; this body/status is the final response.
    pub fn halt(status: u16, body: impl Into<String>) -> Self {
        Self {
            next: false,
            body: body.into(),
            status: Some(status),
            operation: Operation::Write,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }
}

/// Everything a filter invocation may touch: the request scope and the
/// script capabilities of the snapshot the enclosing chain run started with.
pub struct ExecContext<'a> {
    pub scope: &'a Arc<RequestScope>,
    pub script_capabilities: &'a [Arc<dyn ScriptCapability>],
}

/// A pluggable request/response interceptor.
pub trait Filter: Send + Sync {
    fn config(&self) -> FilterConfig;

    fn exec(&self, ctx: &ExecContext<'_>, body: &str) -> Result<FilterOutcome, FilterError>;
}

/// A plugin-provided binding exposing host functionality into the embedded
/// scripting context. `bind` runs once per script invocation and may
/// register any number of functions or values; by convention the primary
/// entry point is registered under [`name`], which is also the identifier
/// used in logs and on the admin surface.
///
/// [`name`]: ScriptCapability::name
pub trait ScriptCapability: Send + Sync {
    /// Registry identifier for this capability.
    fn name(&self) -> &str;

    /// Register a callable/value into the per-run engine. Bindings that do
    /// blocking host I/O must stay within the request's time budget; the
    /// engine's operation limits are the backstop, not a substitute.
    fn bind(&self, scope: &Arc<RequestScope>, engine: &mut rhai::Engine);
}

/// The value resolved from a native module's entry symbol. Both accessors
/// are probed independently; a module may answer either, neither, or both.
pub trait PluginModule: Send + Sync {
    fn filter(&self) -> Option<Arc<dyn Filter>>;

    fn script_capability(&self) -> Option<Arc<dyn ScriptCapability>>;
}
