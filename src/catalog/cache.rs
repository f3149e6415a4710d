use super::{Catalog, CatalogScope, CatalogWord};
use crate::WordId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-through cache in front of a [`Catalog`].
///
/// Entries live until [`CatalogCache::invalidate`] or
/// [`CatalogCache::invalidate_all`] is called, e.g. after a textbook import.
pub struct CatalogCache {
    inner: Arc<dyn Catalog>,
    scopes: RwLock<HashMap<CatalogScope, Arc<Vec<CatalogWord>>>>,
    words: RwLock<HashMap<WordId, CatalogWord>>,
}

impl CatalogCache {
    pub fn new(inner: Arc<dyn Catalog>) -> Self {
        Self {
            inner,
            scopes: RwLock::new(HashMap::new()),
            words: RwLock::new(HashMap::new()),
        }
    }

    /// Words of a scope, loaded from the backing catalog on first use
    pub fn scope_words(&self, scope: &CatalogScope) -> Arc<Vec<CatalogWord>> {
        if let Some(words) = self.scopes.read().get(scope) {
            return Arc::clone(words);
        }

        let words = Arc::new(self.inner.lookup(scope));
        tracing::debug!(%scope, words = words.len(), "catalog scope cached");
        self.scopes
            .write()
            .entry(scope.clone())
            .or_insert(words)
            .clone()
    }

    pub fn invalidate(&self, scope: &CatalogScope) {
        if let Some(words) = self.scopes.write().remove(scope) {
            let mut cached = self.words.write();
            for word in words.iter() {
                cached.remove(&word.word_id);
            }
        }
    }

    pub fn invalidate_all(&self) {
        self.scopes.write().clear();
        self.words.write().clear();
    }

    pub fn cached_scopes(&self) -> usize {
        self.scopes.read().len()
    }
}

impl Catalog for CatalogCache {
    fn lookup(&self, scope: &CatalogScope) -> Vec<CatalogWord> {
        self.scope_words(scope).as_ref().clone()
    }

    fn word(&self, word_id: WordId) -> Option<CatalogWord> {
        if let Some(word) = self.words.read().get(&word_id) {
            return Some(word.clone());
        }
        // misses are not cached: a later import may add the word
        let word = self.inner.word(word_id)?;
        self.words.write().insert(word_id, word.clone());
        Some(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        lookups: AtomicUsize,
        words: Vec<CatalogWord>,
    }

    impl Catalog for CountingCatalog {
        fn lookup(&self, scope: &CatalogScope) -> Vec<CatalogWord> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if scope.edition == "test" {
                self.words.clone()
            } else {
                Vec::new()
            }
        }

        fn word(&self, word_id: WordId) -> Option<CatalogWord> {
            self.words.iter().find(|w| w.word_id == word_id).cloned()
        }
    }

    fn counting() -> Arc<CountingCatalog> {
        Arc::new(CountingCatalog {
            lookups: AtomicUsize::new(0),
            words: vec![CatalogWord {
                word_id: 1,
                text: "山".to_string(),
                pinyin: "shān".to_string(),
                hint: None,
                kind: "写字".to_string(),
                unit: 1,
                lesson: Some(1),
            }],
        })
    }

    #[test]
    fn test_scope_lookups_are_cached() {
        let backing = counting();
        let cache = CatalogCache::new(backing.clone());
        let scope = CatalogScope::new(1, 1, "test");

        assert_eq!(cache.scope_words(&scope).len(), 1);
        assert_eq!(cache.scope_words(&scope).len(), 1);
        assert_eq!(backing.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_scopes(), 1);
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let backing = counting();
        let cache = CatalogCache::new(backing.clone());
        let scope = CatalogScope::new(1, 1, "test");

        cache.scope_words(&scope);
        cache.invalidate(&scope);
        cache.scope_words(&scope);
        assert_eq!(backing.lookups.load(Ordering::SeqCst), 2);

        cache.invalidate_all();
        assert_eq!(cache.cached_scopes(), 0);
    }

    #[test]
    fn test_word_lookup_reads_through() {
        let cache = CatalogCache::new(counting());
        assert_eq!(cache.word(1).unwrap().text, "山");
        assert!(cache.word(2).is_none());
    }
}
