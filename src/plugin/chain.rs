//! Ordered filter-chain execution.

use crate::error::FilterError;
use crate::metrics::Metrics;
use crate::plugin::api::{ExecContext, InvokePoint};
use crate::plugin::registry::RegistrySnapshot;
use crate::scope::RequestScope;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Where a completed chain run leaves the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    /// All matching filters said continue; dispatch `body` to the backend.
    Proceed { body: Bytes },
    /// A filter stopped the chain; its body/status is the final response
    /// and the backend is never contacted.
    Halt { status: u16, body: Bytes },
}

/// Runs the filters of one snapshot, for one invoke point, against one
/// request. The snapshot is fixed at construction: a concurrent reload
/// never changes the set of filters mid-run.
pub struct FilterChain {
    snapshot: Arc<RegistrySnapshot>,
    invoke_point: InvokePoint,
    metrics: Arc<Metrics>,
}

impl FilterChain {
    pub fn new(
        snapshot: Arc<RegistrySnapshot>,
        invoke_point: InvokePoint,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            snapshot,
            invoke_point,
            metrics,
        }
    }

    /// Execute the matching filters in ascending order (ties by discovery
    /// order, already fixed in the snapshot). See [`ChainVerdict`] for the
    /// continue/halt semantics; an `Err` aborts the chain immediately.
    ///
    /// Filters speak text; the body is converted at each matching filter's
    /// boundary and nowhere else, so a request no filter matches passes
    /// through bit-exact even when it is not UTF-8.
    pub fn run(
        &self,
        scope: &Arc<RequestScope>,
        initial_body: Bytes,
    ) -> Result<ChainVerdict, FilterError> {
        let ctx = ExecContext {
            scope,
            script_capabilities: &self.snapshot.script_capabilities,
        };

        let mut body = initial_body;

        for entry in &self.snapshot.filters {
            if entry.config.invoke_point != self.invoke_point {
                continue;
            }
            if !entry.pattern.is_match(&scope.path) {
                continue;
            }

            let name = entry.config.name.as_str();
            let invoke = self.invoke_point.as_str();
            debug!(filter = name, invoke_point = invoke, path = %scope.path, "Running filter");

            let text = String::from_utf8_lossy(&body);
            let start = Instant::now();
            let result = entry.filter.exec(&ctx, &text);
            let elapsed = start.elapsed();

            match result {
                Err(e) => {
                    self.metrics
                        .record_filter(name, invoke, e.response_status(), elapsed);
                    warn!(filter = name, error = %e, "Filter failed, aborting chain");
                    return Err(e);
                }
                Ok(outcome) => {
                    let code = outcome.status.unwrap_or(200);
                    self.metrics.record_filter(name, invoke, code, elapsed);

                    if !outcome.next {
                        debug!(filter = name, status = code, "Filter halted the chain");
                        return Ok(ChainVerdict::Halt {
                            status: code,
                            body: Bytes::from(outcome.body),
                        });
                    }
                    body = Bytes::from(outcome.body);
                }
            }
        }

        Ok(ChainVerdict::Proceed { body })
    }
}
