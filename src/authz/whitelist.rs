//! Static identity whitelist.
//!
//! The policy file is a JSON object mapping subject identity to a boolean.
//! Only an entry set to `true` allows; request metadata is ignored. Presence
//! alone is not enough: an entry set to `false` denies exactly like a missing
//! one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{PolicyEvaluator, PolicyKind, RequestContext, Source};
use crate::Result;
use crate::refresh::{RefreshingCache, Snapshot};

/// Hot-reloaded identity whitelist.
#[derive(Debug)]
pub struct WhitelistPolicy {
    entries: Snapshot<HashMap<String, bool>>,
    cache: RefreshingCache,
}

impl WhitelistPolicy {
    /// Load the whitelist file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file is unreadable or is not a
    /// JSON object of booleans.
    pub fn new(path: impl Into<PathBuf>, refresh_interval: Duration) -> Result<Self> {
        let entries = Snapshot::default();
        let published = entries.clone();
        let cache = RefreshingCache::new(path, refresh_interval, move |bytes| {
            let parsed: HashMap<String, bool> =
                serde_json::from_slice(bytes).map_err(|e| format!("invalid whitelist: {e}"))?;
            debug!(entries = parsed.len(), "Whitelist parsed");
            published.swap(parsed);
            Ok(())
        })?;

        Ok(Self { entries, cache })
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &RefreshingCache {
        &self.cache
    }
}

impl PolicyEvaluator for WhitelistPolicy {
    fn is_allowed(&self, source: &Source, _request: &RequestContext) -> bool {
        self.entries
            .load()
            .get(&source.identity)
            .copied()
            .unwrap_or(false)
    }

    fn start(&self, cancel: CancellationToken) {
        self.cache.start(cancel);
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Whitelist
    }
}
