//! In-memory action cache
//!
//! Keyed by the action cache key. An entry is only served while every
//! output it recorded is still on disk with the recorded digest.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::node::ActionOutcome;
use crate::collab::FileStore;

#[derive(Debug, Default)]
pub struct ActionCache {
    entries: Mutex<HashMap<String, Arc<ActionOutcome>>>,
}

impl ActionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(
        &self,
        cache_key: &str,
        exec_root: &Path,
        files: &dyn FileStore,
    ) -> Option<Arc<ActionOutcome>> {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cache_key)
            .cloned()?;
        let intact = entry.output_digests.iter().all(|(path, digest)| {
            files
                .digest(&exec_root.join(path))
                .map(|current| &current == digest)
                .unwrap_or(false)
        });
        if !intact {
            debug!(action = %entry.id, "cached outputs changed on disk");
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(cache_key);
            return None;
        }
        Some(entry)
    }

    /// Store a cacheable outcome; others are ignored
    pub fn store(&self, outcome: Arc<ActionOutcome>) {
        if !outcome.cacheable {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(outcome.cache_key.clone(), outcome);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionId;
    use crate::collab::{Digest, LocalFileStore};
    use crate::packages::Label;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn outcome(digest: Digest, cacheable: bool) -> Arc<ActionOutcome> {
        let mut output_digests = BTreeMap::new();
        output_digests.insert(PathBuf::from("out/a.o"), digest);
        Arc::new(ActionOutcome {
            id: ActionId::new("compile-a"),
            mnemonic: "CppCompile".to_string(),
            owner: Label::parse_absolute("//pkg:a").unwrap(),
            output_digests,
            cacheable,
            cache_key: "k1".to_string(),
            test_result: None,
            from_cache: false,
        })
    }

    #[test]
    fn test_hit_requires_intact_outputs() {
        let dir = TempDir::new().unwrap();
        let files = LocalFileStore;
        files.write_bytes(&dir.path().join("out/a.o"), b"obj").unwrap();
        let cache = ActionCache::new();
        cache.store(outcome(Digest::of_bytes(b"obj"), true));

        assert!(cache.lookup("k1", dir.path(), &files).is_some());

        files.write_bytes(&dir.path().join("out/a.o"), b"changed").unwrap();
        assert!(cache.lookup("k1", dir.path(), &files).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_non_cacheable_outcomes_are_not_stored() {
        let cache = ActionCache::new();
        cache.store(outcome(Digest::of_bytes(b"obj"), false));
        assert!(cache.is_empty());
    }
}
