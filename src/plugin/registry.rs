//! Plugin discovery and the atomically swapped registry snapshot.

use crate::plugin::api::{Filter, ScriptCapability};
use crate::plugin::loader;
use crate::script::ScriptFilter;
use arc_swap::ArcSwap;
use libloading::Library;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// A registered filter with its config and precompiled path pattern.
pub struct FilterEntry {
    pub filter: Arc<dyn Filter>,
    pub config: crate::plugin::api::FilterConfig,
    pub pattern: Regex,
}

/// One consistent view of the registries. Chain runs and script bridges
/// take a snapshot once at start and never observe a partial rebuild.
#[derive(Default)]
pub struct RegistrySnapshot {
    /// Sorted by ascending order; ties keep discovery order (stable sort).
    pub filters: Vec<FilterEntry>,
    pub script_capabilities: Vec<Arc<dyn ScriptCapability>>,
}

pub struct PluginRegistry {
    dir: PathBuf,
    snapshot: ArcSwap<RegistrySnapshot>,
    // Native libraries are never unloaded: descriptors handed out from an
    // old snapshot may still be running when a reload publishes a new one.
    libraries: Mutex<Vec<Library>>,
}

impl PluginRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// The current snapshot. Hold the returned `Arc` for the whole run.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Scan the plugin directory and publish a fresh snapshot as one unit.
    /// Every per-entry failure is logged and skipped; a directory read
    /// failure publishes empty registries and the proxy keeps running.
    pub fn load(&self) -> Arc<RegistrySnapshot> {
        let mut filters: Vec<FilterEntry> = Vec::new();
        let mut capabilities: Vec<Arc<dyn ScriptCapability>> = Vec::new();
        let mut libraries: Vec<Library> = Vec::new();

        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                // read_dir order is platform-dependent; the sorted listing
                // is the discovery order the tie-break rule refers to.
                let mut paths: Vec<PathBuf> =
                    entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
                paths.sort();

                for path in paths {
                    self.load_entry(&path, &mut filters, &mut capabilities, &mut libraries);
                }
            }
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "Could not read plugin directory");
            }
        }

        // Stable sort: equal orders keep discovery order.
        filters.sort_by_key(|entry| entry.config.order);

        let snapshot = Arc::new(RegistrySnapshot {
            filters,
            script_capabilities: capabilities,
        });

        info!(
            filters = snapshot.filters.len(),
            script_capabilities = snapshot.script_capabilities.len(),
            dir = %self.dir.display(),
            "Plugin registry loaded"
        );

        self.libraries.lock().unwrap().extend(libraries);
        self.snapshot.store(snapshot.clone());
        snapshot
    }

    fn load_entry(
        &self,
        path: &Path,
        filters: &mut Vec<FilterEntry>,
        capabilities: &mut Vec<Arc<dyn ScriptCapability>>,
        libraries: &mut Vec<Library>,
    ) {
        match path.extension().and_then(|e| e.to_str()) {
            Some("so") | Some("dylib") | Some("dll") => {
                debug!(path = %path.display(), "Loading native plugin module");
                match loader::load_native(path) {
                    Ok((library, record)) => {
                        libraries.push(library);
                        if let Some(filter) = record.filter {
                            Self::register_filter(filter, filters);
                        }
                        if let Some(capability) = record.script_capability {
                            info!(plugin = %capability.name(), "Script capability registered");
                            capabilities.push(capability);
                        }
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Could not load plugin");
                    }
                }
            }
            Some("rhai") => {
                debug!(path = %path.display(), "Loading script filter");
                match ScriptFilter::load(path) {
                    Ok(filter) => Self::register_filter(Arc::new(filter), filters),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Could not load script filter");
                    }
                }
            }
            _ => {
                debug!(path = %path.display(), "Skipping non-plugin directory entry");
            }
        }
    }

    fn register_filter(filter: Arc<dyn Filter>, filters: &mut Vec<FilterEntry>) {
        let config = filter.config();
        match Regex::new(&config.path_pattern) {
            Ok(pattern) => {
                info!(plugin = %config.name, order = config.order, "Filter registered");
                filters.push(FilterEntry {
                    filter,
                    config,
                    pattern,
                });
            }
            Err(e) => {
                error!(plugin = %config.name, pattern = %config.path_pattern, error = %e,
                    "Filter has an invalid path pattern, dropping");
            }
        }
    }
}
