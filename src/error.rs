use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin load error: {0}")]
    PluginLoad(#[from] PluginLoadError),

    #[error("Filter execution error: {0}")]
    FilterExecution(#[from] FilterError),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Transport cannot be hijacked: {0}")]
    HijackUnsupported(String),

    #[error("Stream I/O error: {0}")]
    StreamIo(#[source] io::Error),

    #[error("Malformed HTTP request: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Per-entry failure during a plugin directory scan. Recovered locally:
/// the scan logs it and moves on to the next entry.
#[derive(Error, Debug)]
pub enum PluginLoadError {
    #[error("Failed to open module {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Module {path} is missing the `{symbol}` entry symbol: {reason}")]
    MissingSymbol {
        path: String,
        symbol: String,
        reason: String,
    },

    #[error("Module {path} satisfies neither the filter nor the script capability contract")]
    NoCapability { path: String },

    #[error("Script {path} failed to compile: {reason}")]
    ScriptCompile { path: String, reason: String },

    #[error("Script {path} has an invalid filter declaration: {reason}")]
    ScriptConfig { path: String, reason: String },
}

/// A filter's `exec` reported failure. Aborts the chain and becomes the
/// request's response; `status`/`body` override the generic 500 when unset.
#[derive(Error, Debug)]
#[error("filter '{filter}' failed: {message}")]
pub struct FilterError {
    pub filter: String,
    pub message: String,
    pub status: Option<u16>,
    pub body: Option<String>,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            message: message.into(),
            status: None,
            body: None,
        }
    }

    pub fn with_response(mut self, status: u16, body: impl Into<String>) -> Self {
        self.status = Some(status);
        self.body = Some(body.into());
        self
    }

    pub fn response_status(&self) -> u16 {
        self.status.unwrap_or(500)
    }

    pub fn response_body(&self) -> String {
        self.body
            .clone()
            .unwrap_or_else(|| format!("filter '{}' failed", self.filter))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl warp::reject::Reject for ProxyError {}
