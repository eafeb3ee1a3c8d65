//! Native module loading via the platform dynamic loader.

use crate::error::PluginLoadError;
use crate::plugin::api::{Filter, PluginEntry, PluginModule, ScriptCapability, PLUGIN_ENTRY_SYMBOL};
use libloading::Library;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Outcome of loading one directory entry: which capabilities the resolved
/// module answered for.
pub struct PluginRecord {
    pub path: PathBuf,
    pub filter: Option<Arc<dyn Filter>>,
    pub script_capability: Option<Arc<dyn ScriptCapability>>,
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("path", &self.path)
            .field("filter", &self.filter.is_some())
            .field("script_capability", &self.script_capability.is_some())
            .finish()
    }
}

impl PluginRecord {
    pub fn is_empty(&self) -> bool {
        self.filter.is_none() && self.script_capability.is_none()
    }
}

/// Open a native module, resolve the fixed entry symbol, and probe the
/// returned value against both capability contracts.
///
/// The returned [`Library`] must be kept alive for as long as any descriptor
/// from the record may run; the registry retains it for the process
/// lifetime.
pub(crate) fn load_native(path: &Path) -> Result<(Library, PluginRecord), PluginLoadError> {
    let library = unsafe { Library::new(path) }.map_err(|e| PluginLoadError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let entry = unsafe { library.get::<PluginEntry>(PLUGIN_ENTRY_SYMBOL) }.map_err(|e| {
        PluginLoadError::MissingSymbol {
            path: path.display().to_string(),
            symbol: String::from_utf8_lossy(PLUGIN_ENTRY_SYMBOL).into_owned(),
            reason: e.to_string(),
        }
    })?;

    let module: Arc<dyn PluginModule> = Arc::from(unsafe { entry() });
    let record = probe(path, module.as_ref())?;

    Ok((library, record))
}

/// Probe one module value against both contracts independently.
pub(crate) fn probe(
    path: &Path,
    module: &dyn PluginModule,
) -> Result<PluginRecord, PluginLoadError> {
    let record = PluginRecord {
        path: path.to_path_buf(),
        filter: module.filter(),
        script_capability: module.script_capability(),
    };

    if let Some(filter) = &record.filter {
        debug!(plugin = %filter.config().name, kind = "filter", path = %path.display(), "Plugin capability resolved");
    }
    if let Some(capability) = &record.script_capability {
        debug!(plugin = %capability.name(), kind = "script", path = %path.display(), "Plugin capability resolved");
    }

    if record.is_empty() {
        return Err(PluginLoadError::NoCapability {
            path: path.display().to_string(),
        });
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::plugin::api::{ExecContext, FilterConfig, FilterOutcome, InvokePoint};

    struct NoopFilter;

    impl Filter for NoopFilter {
        fn config(&self) -> FilterConfig {
            FilterConfig {
                name: "noop".into(),
                order: 0,
                path_pattern: ".*".into(),
                invoke_point: InvokePoint::Request,
            }
        }

        fn exec(&self, _ctx: &ExecContext<'_>, body: &str) -> Result<FilterOutcome, FilterError> {
            Ok(FilterOutcome::next(body))
        }
    }

    struct EchoCapability;

    impl ScriptCapability for EchoCapability {
        fn name(&self) -> &str {
            "echo"
        }

        fn bind(&self, _scope: &Arc<crate::scope::RequestScope>, engine: &mut rhai::Engine) {
            engine.register_fn("echo", |s: &str| s.to_string());
        }
    }

    struct DualModule;

    impl PluginModule for DualModule {
        fn filter(&self) -> Option<Arc<dyn Filter>> {
            Some(Arc::new(NoopFilter))
        }

        fn script_capability(&self) -> Option<Arc<dyn ScriptCapability>> {
            Some(Arc::new(EchoCapability))
        }
    }

    struct EmptyModule;

    impl PluginModule for EmptyModule {
        fn filter(&self) -> Option<Arc<dyn Filter>> {
            None
        }

        fn script_capability(&self) -> Option<Arc<dyn ScriptCapability>> {
            None
        }
    }

    #[test]
    fn probe_registers_both_capabilities_from_one_module() {
        let record = probe(Path::new("dual.so"), &DualModule).unwrap();
        assert!(record.filter.is_some());
        assert!(record.script_capability.is_some());
    }

    #[test]
    fn probe_rejects_module_with_no_capability() {
        let err = probe(Path::new("empty.so"), &EmptyModule).unwrap_err();
        assert!(matches!(err, PluginLoadError::NoCapability { .. }));
    }

    #[test]
    fn load_native_reports_open_failure() {
        let err = load_native(Path::new("/nonexistent/libplugin.so")).unwrap_err();
        assert!(matches!(err, PluginLoadError::Open { .. }));
    }
}
