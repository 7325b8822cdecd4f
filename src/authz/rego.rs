//! Rego policy evaluation.
//!
//! The policy file is a single Rego module compiled under the module name
//! [`MODULE_NAME`]; the decision is the value of [`ALLOW_RULE`]. Only a
//! boolean `true` allows. `false`, an undefined rule, a non-boolean value or
//! an evaluation error all deny.

use std::path::PathBuf;
use std::time::Duration;

use regorus::{Engine, Value as RegoValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PolicyError, PolicyEvaluator, PolicyInput, PolicyKind, RequestContext, Source};
use crate::Result;
use crate::refresh::{RefreshingCache, Snapshot};

/// Module name the policy source is registered under.
pub const MODULE_NAME: &str = "knative.dev";

/// Rule queried for the decision.
pub const ALLOW_RULE: &str = "data.knative.dev.allow";

/// Hot-reloaded Rego evaluator.
pub struct RegoPolicy {
    engine: Snapshot<Engine>,
    cache: RefreshingCache,
}

impl RegoPolicy {
    /// Compile the policy file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file is unreadable or does not
    /// compile.
    pub fn new(path: impl Into<PathBuf>, refresh_interval: Duration) -> Result<Self> {
        let engine = Snapshot::new(Engine::new());
        let published = engine.clone();
        let cache = RefreshingCache::new(path, refresh_interval, move |bytes| {
            let compiled = compile(bytes).map_err(|e| e.to_string())?;
            published.swap(compiled);
            Ok(())
        })?;

        Ok(Self { engine, cache })
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &RefreshingCache {
        &self.cache
    }

    /// Evaluate `input`, surfacing failures instead of collapsing them.
    pub fn evaluate(&self, input: &PolicyInput<'_>) -> std::result::Result<bool, PolicyError> {
        let json = serde_json::to_string(input).map_err(|e| PolicyError::Input(e.to_string()))?;
        let input = RegoValue::from_json_str(&json).map_err(|e| PolicyError::Input(e.to_string()))?;

        // Evaluation needs `&mut`; work on a private copy of this generation.
        let mut engine = Engine::clone(&self.engine.load());
        engine.set_input(input);
        let result = engine
            .eval_rule(ALLOW_RULE.to_string())
            .map_err(|e| PolicyError::Evaluation(e.to_string()))?;

        debug!(result = ?result, "Rego decision");
        Ok(matches!(result, RegoValue::Bool(true)))
    }
}

impl std::fmt::Debug for RegoPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegoPolicy")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl PolicyEvaluator for RegoPolicy {
    fn is_allowed(&self, source: &Source, request: &RequestContext) -> bool {
        match self.evaluate(&PolicyInput { source, request }) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(error = %e, "Policy evaluation failed, denying");
                false
            }
        }
    }

    fn start(&self, cancel: CancellationToken) {
        self.cache.start(cancel);
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Rego
    }
}

/// Compile a module and evaluate the decision rule once against empty input.
fn compile(bytes: &[u8]) -> std::result::Result<Engine, PolicyError> {
    let source = std::str::from_utf8(bytes).map_err(|e| PolicyError::Compile(e.to_string()))?;

    let mut engine = Engine::new();
    engine
        .add_policy(MODULE_NAME.to_string(), source.to_string())
        .map_err(|e| PolicyError::Compile(e.to_string()))?;

    // Surfaces unresolvable references now rather than on the first request.
    let mut trial = engine.clone();
    trial.set_input(RegoValue::new_object());
    trial
        .eval_rule(ALLOW_RULE.to_string())
        .map_err(|e| PolicyError::Compile(e.to_string()))?;

    Ok(engine)
}
