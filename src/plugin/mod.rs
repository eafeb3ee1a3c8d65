//! Plugin system for bridle.
//!
//! Filters and script capabilities are discovered at startup from a single
//! plugin directory. Native modules (`.so`/`.dylib`/`.dll`) expose one fixed
//! entry symbol and are probed against both capability contracts
//! independently; one module may provide a filter, a script capability, or
//! both. Rhai scripts (`.rhai`) become script-authored filters executed
//! through the [`crate::script`] bridge.
//!
//! A single bad entry never aborts the scan. Reload replaces the whole
//! registry snapshot atomically; in-flight chain runs keep the snapshot they
//! took at start.

pub mod api;
pub mod chain;
pub mod loader;
pub mod registry;

pub use api::{
    ExecContext, Filter, FilterConfig, FilterOutcome, InvokePoint, Operation, PluginModule,
    ScriptCapability, PLUGIN_ENTRY_SYMBOL,
};
pub use chain::{ChainVerdict, FilterChain};
pub use loader::PluginRecord;
pub use registry::{FilterEntry, PluginRegistry, RegistrySnapshot};
