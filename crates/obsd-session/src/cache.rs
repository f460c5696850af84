use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use obsd_core::SessionId;

use crate::error::SessionError;
use crate::scenes::SceneSnapshot;
use crate::stats::StatsSnapshot;
use crate::stream::OutputSnapshot;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

struct Slot<T> {
    owner: u64,
    value: T,
}

/// Process-wide read mirror of one snapshot kind, keyed by session.
///
/// Only the owning manager writes; everyone else reads clones. An entry lives
/// exactly as long as the [`CacheEntry`] returned by [`CacheStore::register`].
pub struct CacheStore<T> {
    map: Arc<DashMap<SessionId, Slot<T>>>,
}

impl<T> Clone for CacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
        }
    }
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> CacheStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<T> {
        self.map.get(session_id).map(|slot| slot.value.clone())
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.map.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Create (or take over) the entry for `session_id`.
    pub(crate) fn register(&self, session_id: SessionId, initial: T) -> CacheEntry<T> {
        let owner = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        self.map.insert(
            session_id.clone(),
            Slot {
                owner,
                value: initial,
            },
        );
        CacheEntry {
            map: Arc::clone(&self.map),
            session_id,
            owner,
        }
    }
}

/// Write half of a cache entry. Dropping it removes the entry, unless a newer
/// owner has already replaced it.
pub(crate) struct CacheEntry<T> {
    map: Arc<DashMap<SessionId, Slot<T>>>,
    session_id: SessionId,
    owner: u64,
}

impl<T> CacheEntry<T> {
    pub(crate) fn set(&self, value: T) {
        if let Some(mut slot) = self.map.get_mut(&self.session_id) {
            if slot.owner == self.owner {
                slot.value = value;
            }
        }
    }
}

impl<T> Drop for CacheEntry<T> {
    fn drop(&mut self) {
        let owner = self.owner;
        self.map
            .remove_if(&self.session_id, |_, slot| slot.owner == owner);
    }
}

/// The three mirrors shared by every session in the process.
#[derive(Clone, Default)]
pub struct Caches {
    pub scenes: CacheStore<SceneSnapshot>,
    pub outputs: CacheStore<OutputSnapshot>,
    pub stats: CacheStore<StatsSnapshot>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scenes(&self, session_id: &SessionId) -> Result<SceneSnapshot, SessionError> {
        self.scenes
            .get(session_id)
            .ok_or_else(|| SessionError::CacheNotFound(session_id.clone()))
    }

    pub fn outputs(&self, session_id: &SessionId) -> Result<OutputSnapshot, SessionError> {
        self.outputs
            .get(session_id)
            .ok_or_else(|| SessionError::CacheNotFound(session_id.clone()))
    }

    pub fn stats(&self, session_id: &SessionId) -> Result<StatsSnapshot, SessionError> {
        self.stats
            .get(session_id)
            .ok_or_else(|| SessionError::CacheNotFound(session_id.clone()))
    }
}
