//! Outbound credential store.
//!
//! The credential root holds one file per audience; the file name is the
//! audience and the contents are the raw bearer credential. Every file is an
//! independent [`RefreshingCache`]. The reserved [`UNSCOPED`] entry is
//! mandatory and is never returned by host matching.
//!
//! Names beginning with `..` are skipped (projected-volume bookkeeping such as
//! `..data`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::refresh::RefreshingCache;
use crate::{Error, Result};

/// Audience name of the credential not bound to any destination.
pub const UNSCOPED: &str = "unscoped";

/// Per-audience outbound credentials.
pub struct CredentialStore {
    root: PathBuf,
    tokens: Arc<DashMap<String, String>>,
    caches: Vec<RefreshingCache>,
}

impl CredentialStore {
    /// Load every credential under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the root cannot be listed, any credential
    /// file cannot be read, or no unscoped credential exists.
    pub fn new(root: impl Into<PathBuf>, refresh_interval: Duration) -> Result<Self> {
        let root = root.into();
        let entries = std::fs::read_dir(&root).map_err(|e| {
            Error::Config(format!(
                "failed to list credential root {}: {e}",
                root.display()
            ))
        })?;

        let tokens = Arc::new(DashMap::new());
        let mut caches = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::Config(format!(
                    "failed to list credential root {}: {e}",
                    root.display()
                ))
            })?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %entry.path().display(), "Skipping non UTF-8 credential name");
                continue;
            };
            if name.starts_with("..") {
                continue;
            }

            let audience = canonical_audience(&name);
            let published = Arc::clone(&tokens);
            let cache = RefreshingCache::new(entry.path(), refresh_interval, move |bytes| {
                let token = std::str::from_utf8(bytes)
                    .map_err(|e| format!("credential is not UTF-8: {e}"))?
                    .trim_end()
                    .to_string();
                published.insert(audience.clone(), token);
                Ok(())
            })?;
            caches.push(cache);
        }

        if !tokens.contains_key(UNSCOPED) {
            return Err(Error::Config(format!(
                "no {UNSCOPED} credential found under {}",
                root.display()
            )));
        }

        Ok(Self {
            root,
            tokens,
            caches,
        })
    }

    /// Start one refresh task per audience.
    pub fn start(&self, cancel: CancellationToken) {
        for cache in &self.caches {
            cache.start(cancel.clone());
        }
    }

    /// Best credential for `host`.
    ///
    /// An audience equal to `host` wins outright. Otherwise the longest
    /// audience that is a suffix of `host` wins. The unscoped credential is
    /// never a candidate.
    #[must_use]
    pub fn find_token(&self, host: &str) -> Option<String> {
        let mut best: Option<(usize, String)> = None;

        for entry in self.tokens.iter() {
            let audience = entry.key();
            if audience == UNSCOPED {
                continue;
            }
            if audience == host {
                return Some(entry.value().clone());
            }
            if !host.ends_with(audience.as_str()) {
                continue;
            }
            if best.as_ref().is_none_or(|(len, _)| audience.len() > *len) {
                best = Some((audience.len(), entry.value().clone()));
            }
        }

        best.map(|(_, token)| token)
    }

    /// The unscoped credential.
    #[must_use]
    pub fn unscoped_token(&self) -> Option<String> {
        self.tokens.get(UNSCOPED).map(|token| token.value().clone())
    }

    /// Audience names, sorted.
    #[must_use]
    pub fn audiences(&self) -> Vec<String> {
        let mut audiences: Vec<String> = self.tokens.iter().map(|e| e.key().clone()).collect();
        audiences.sort();
        audiences
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("root", &self.root)
            .field("audiences", &self.audiences())
            .finish_non_exhaustive()
    }
}

fn canonical_audience(name: &str) -> String {
    if name.eq_ignore_ascii_case(UNSCOPED) {
        UNSCOPED.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn root_with(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, token) in files {
            std::fs::write(dir.path().join(name), token).unwrap();
        }
        dir
    }

    fn store(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path(), Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn exact_match_wins_over_suffix() {
        let dir = root_with(&[
            ("foo.com", "foo-token"),
            ("a.foo.com", "a-foo-token"),
            ("unscoped", "u"),
        ]);
        let store = store(&dir);

        assert_eq!(store.find_token("a.foo.com").as_deref(), Some("a-foo-token"));
        assert_eq!(store.find_token("foo.com").as_deref(), Some("foo-token"));
    }

    #[test]
    fn longest_suffix_wins() {
        let dir = root_with(&[
            ("foo.com", "foo-token"),
            ("a.foo.com", "a-foo-token"),
            ("unscoped", "u"),
        ]);
        let store = store(&dir);

        assert_eq!(store.find_token("x.a.foo.com").as_deref(), Some("a-foo-token"));
        assert_eq!(store.find_token("b.foo.com").as_deref(), Some("foo-token"));
    }

    #[test]
    fn lookup_is_repeatable() {
        let dir = root_with(&[
            ("example.com", "e"),
            ("billing.example.com", "b"),
            ("unscoped", "u"),
        ]);
        let store = store(&dir);

        for _ in 0..10 {
            assert_eq!(store.find_token("api.billing.example.com").as_deref(), Some("b"));
        }
    }

    #[test]
    fn unscoped_is_never_a_host_match() {
        let dir = root_with(&[("unscoped", "u")]);
        let store = store(&dir);

        assert_eq!(store.find_token("unscoped"), None);
        assert_eq!(store.find_token("svc.unscoped"), None);
        assert_eq!(store.unscoped_token().as_deref(), Some("u"));
    }

    #[test]
    fn no_match_is_none() {
        let dir = root_with(&[("foo.com", "f"), ("unscoped", "u")]);
        let store = store(&dir);

        assert_eq!(store.find_token("bar.org"), None);
    }

    #[test]
    fn missing_unscoped_fails_construction() {
        let dir = root_with(&[("foo.com", "f")]);

        let err = CredentialStore::new(dir.path(), Duration::from_secs(60)).unwrap_err();

        assert!(err.is_config());
        assert!(err.to_string().contains(UNSCOPED));
    }

    #[test]
    fn unscoped_name_is_case_insensitive() {
        let dir = root_with(&[("UNSCOPED", "u")]);
        let store = store(&dir);

        assert_eq!(store.unscoped_token().as_deref(), Some("u"));
        assert_eq!(store.audiences(), vec!["unscoped"]);
    }

    #[test]
    fn dot_dot_entries_are_skipped() {
        let dir = root_with(&[("unscoped", "u")]);
        std::fs::create_dir(dir.path().join("..data")).unwrap();
        std::fs::write(dir.path().join("..2024_01_01"), "ignored").unwrap();
        let store = store(&dir);

        assert_eq!(store.audiences(), vec!["unscoped"]);
    }

    #[test]
    fn trailing_whitespace_is_trimmed() {
        let dir = root_with(&[("unscoped", "token-value\n")]);
        let store = store(&dir);

        assert_eq!(store.unscoped_token().as_deref(), Some("token-value"));
    }

    #[test]
    fn reload_updates_single_audience() {
        let dir = root_with(&[("foo.com", "old"), ("unscoped", "u")]);
        let store = store(&dir);

        std::fs::write(dir.path().join("foo.com"), "new").unwrap();
        for cache in &store.caches {
            cache.reload().unwrap();
        }

        assert_eq!(store.find_token("foo.com").as_deref(), Some("new"));
        assert_eq!(store.unscoped_token().as_deref(), Some("u"));
    }

    #[test]
    fn missing_root_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let err = CredentialStore::new(dir.path().join("absent"), Duration::from_secs(60))
            .unwrap_err();
        assert!(err.is_config());
    }
}
