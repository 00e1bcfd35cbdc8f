use crate::scene::TessellatedVertex;
use lru::LruCache;
use lyon::tessellation::VertexBuffers;
use std::num::NonZeroUsize;

/// Tessellated `Graphics` fills, keyed by geometry hash.
///
/// Entries are local-space triangles; colour and transform are applied per
/// draw, so recolouring or moving a shape never re-tessellates it.
pub(crate) struct TessellationCache {
    tessellations: LruCache<u64, VertexBuffers<TessellatedVertex, u16>>,
    hits: u64,
    misses: u64,
}

impl TessellationCache {
    pub(crate) fn new(size: NonZeroUsize) -> Self {
        Self {
            tessellations: LruCache::new(size),
            hits: 0,
            misses: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tessellations.len()
    }

    pub(crate) fn get(&mut self, key: u64) -> Option<&VertexBuffers<TessellatedVertex, u16>> {
        let found = self.tessellations.get(&key);
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub(crate) fn insert(&mut self, key: u64, buffers: VertexBuffers<TessellatedVertex, u16>) {
        self.tessellations.put(key, buffers);
    }

    /// `(hits, misses)` since construction.
    #[cfg(test)]
    pub(crate) fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl std::fmt::Debug for TessellationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TessellationCache")
            .field("len", &self.tessellations.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let mut cache = TessellationCache::new(NonZeroUsize::new(2).unwrap());
        cache.insert(1, VertexBuffers::new());
        cache.insert(2, VertexBuffers::new());
        assert!(cache.get(1).is_some());
        cache.insert(3, VertexBuffers::new());

        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.counters(), (2, 1));
    }
}
