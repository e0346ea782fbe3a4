//! Query result cache.
//!
//! Maps the exact text of a query to its materialized result graph. Entries
//! expire on read once their TTL has elapsed, are evicted least-recently-used
//! past the configured capacity, and are invalidated when a mutation touches
//! any element they depend on.
//!
//! Writes computed from an older view of the store carry the cache
//! generation observed before evaluation began. A write whose dependencies
//! intersect a mutation recorded after that generation is refused, so a slow
//! evaluation can never overwrite the cache with a result that a concurrent
//! mutation has already made stale.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entity::VertexId;
use crate::error::CacheError;
use crate::graph::Graph;

/// Default maximum number of cached query results
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Number of recent mutations retained for stale-write detection
const MUTATION_LOG_CAPACITY: usize = 256;

/// The exact textual query, used as the cache key. Byte-equal texts are equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryDescriptor(String);

impl QueryDescriptor {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryDescriptor {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Cached result with validity metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    descriptor: QueryDescriptor,
    result: Graph,
    created_at: DateTime<Utc>,
    ttl: Duration,
    /// Element hashes whose mutation makes this entry stale
    dependencies: HashSet<String>,
    access_count: u64,
}

enum EntryStatus {
    Missing,
    Fresh,
    Expired,
    Corrupt(CacheError),
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) >= self.ttl
    }

    fn verify(&self, key: &QueryDescriptor) -> Result<(), CacheError> {
        if &self.descriptor != key {
            return Err(CacheError::Corruption {
                descriptor: key.to_string(),
                reason: format!("entry holds result for '{}'", self.descriptor),
            });
        }
        if let Some(id) = self.result.unresolved().find(|id| !self.result.contains_vertex(id)) {
            return Err(CacheError::Corruption {
                descriptor: key.to_string(),
                reason: format!("unresolved vertex {id} is not part of the result"),
            });
        }
        Ok(())
    }

    fn status(&self, key: &QueryDescriptor, now: DateTime<Utc>) -> EntryStatus {
        if let Err(err) = self.verify(key) {
            return EntryStatus::Corrupt(err);
        }
        if self.is_expired(now) {
            EntryStatus::Expired
        } else {
            EntryStatus::Fresh
        }
    }
}

/// A pending cache insertion.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    descriptor: QueryDescriptor,
    result: Graph,
    ttl: Duration,
    roots: Vec<VertexId>,
    observed_generation: Option<u64>,
}

impl CacheWrite {
    pub fn new(descriptor: QueryDescriptor, result: Graph, ttl: Duration) -> Self {
        Self {
            descriptor,
            result,
            ttl,
            roots: Vec::new(),
            observed_generation: None,
        }
    }

    /// Vertices the query started from. New data attached to them invalidates
    /// the entry even when the result does not contain them.
    pub fn with_roots(mut self, roots: impl IntoIterator<Item = VertexId>) -> Self {
        self.roots.extend(roots);
        self
    }

    /// Cache generation read before evaluation started.
    pub fn observed_at(mut self, generation: u64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    fn dependencies(&self) -> HashSet<String> {
        let mut keys: HashSet<String> = self.result.element_keys().map(str::to_string).collect();
        for edge in self.result.edges() {
            keys.insert(edge.source().as_str().to_string());
            keys.insert(edge.destination().as_str().to_string());
        }
        keys.extend(self.roots.iter().map(|id| id.as_str().to_string()));
        keys
    }
}

/// Cache metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    /// Number of entries in the cache
    pub entries: usize,
    /// Maximum number of entries
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped by LRU eviction
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries dropped because a mutation intersected them
    pub invalidations: u64,
    /// Writes refused because a concurrent mutation made them stale
    pub stale_writes: u64,
    /// Entries dropped after failing an integrity check
    pub corruptions: u64,
    /// Hit ratio (hits / (hits + misses))
    pub hit_ratio: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
    stale_writes: u64,
    corruptions: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<QueryDescriptor, CacheEntry>,
    /// Element hash to the descriptors whose entries depend on it
    dependents: HashMap<String, HashSet<QueryDescriptor>>,
    generation: u64,
    mutation_log: VecDeque<(u64, Vec<String>)>,
    counters: Counters,
}

impl CacheState {
    fn index(&mut self, key: &QueryDescriptor, dependencies: &HashSet<String>) {
        for dependency in dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    fn unindex(&mut self, key: &QueryDescriptor, dependencies: &HashSet<String>) {
        for dependency in dependencies {
            if let Some(descriptors) = self.dependents.get_mut(dependency) {
                descriptors.remove(key);
                if descriptors.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
    }

    fn evict(&mut self, key: &QueryDescriptor) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.unindex(key, &entry.dependencies);
        Some(entry)
    }

    /// Whether a mutation after `observed` touches any of `dependencies`.
    fn is_stale(&self, observed: u64, dependencies: &HashSet<String>) -> bool {
        if observed >= self.generation {
            return false;
        }
        // Mutations between `observed` and the oldest retained one were dropped.
        let oldest = self.mutation_log.front().map(|(generation, _)| *generation);
        if oldest.map_or(true, |oldest| oldest > observed + 1) {
            return true;
        }
        self.mutation_log
            .iter()
            .filter(|(generation, _)| *generation > observed)
            .any(|(_, keys)| keys.iter().any(|key| dependencies.contains(key)))
    }
}

/// Bounded, mutation-aware query result cache.
///
/// Shared between the query engine (lookup/commit) and the graph store
/// (invalidation) behind an `Arc`.
#[derive(Debug)]
pub struct QueryCache {
    state: Mutex<CacheState>,
    capacity: NonZeroUsize,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl QueryCache {
    /// Create a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        info!(capacity = capacity.get(), "Initializing query result cache");
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                dependents: HashMap::new(),
                generation: 0,
                mutation_log: VecDeque::with_capacity(MUTATION_LOG_CAPACITY),
                counters: Counters::default(),
            }),
            capacity,
        }
    }

    /// Return a copy of the cached result when an entry exists and `now - created < ttl`.
    pub fn lookup(&self, descriptor: &QueryDescriptor, now: DateTime<Utc>) -> Option<Graph> {
        let mut state = self.state.lock();

        let status = match state.entries.peek(descriptor) {
            None => EntryStatus::Missing,
            Some(entry) => entry.status(descriptor, now),
        };

        match status {
            EntryStatus::Fresh => {
                state.counters.hits += 1;
                let entry = state.entries.get_mut(descriptor)?;
                entry.access_count += 1;
                debug!(descriptor = %descriptor, access_count = entry.access_count, "Cache hit");
                Some(entry.result.clone())
            }
            EntryStatus::Missing => {
                state.counters.misses += 1;
                debug!(descriptor = %descriptor, "Cache miss");
                None
            }
            EntryStatus::Expired => {
                state.evict(descriptor);
                state.counters.expirations += 1;
                state.counters.misses += 1;
                debug!(descriptor = %descriptor, "Cache entry expired");
                None
            }
            EntryStatus::Corrupt(err) => {
                state.evict(descriptor);
                state.counters.corruptions += 1;
                state.counters.misses += 1;
                warn!(error = %err, "Evicting corrupt cache entry");
                None
            }
        }
    }

    /// Insert or replace an entry unconditionally (last write wins).
    pub fn store(&self, descriptor: QueryDescriptor, result: Graph, ttl: Duration) -> bool {
        self.commit(CacheWrite::new(descriptor, result, ttl), Utc::now())
    }

    /// Insert an entry created at `now`.
    ///
    /// Returns `false` when the write was refused: a non-positive TTL, or a
    /// mutation recorded after the write's observed generation intersects
    /// its dependencies.
    pub fn commit(&self, write: CacheWrite, now: DateTime<Utc>) -> bool {
        if write.ttl <= Duration::zero() {
            return false;
        }
        let dependencies = write.dependencies();

        let mut state = self.state.lock();

        if let Some(observed) = write.observed_generation {
            if state.is_stale(observed, &dependencies) {
                state.counters.stale_writes += 1;
                debug!(
                    descriptor = %write.descriptor,
                    observed,
                    generation = state.generation,
                    "Refusing stale cache write"
                );
                return false;
            }
        }

        let key = write.descriptor.clone();
        state.evict(&key);

        let entry = CacheEntry {
            descriptor: write.descriptor,
            result: write.result,
            created_at: now,
            ttl: write.ttl,
            dependencies,
            access_count: 0,
        };
        state.index(&key, &entry.dependencies);

        let displaced = state.entries.push(key.clone(), entry);
        if let Some((evicted_key, evicted)) = displaced {
            state.unindex(&evicted_key, &evicted.dependencies);
            state.counters.evictions += 1;
            debug!(descriptor = %evicted_key, "Evicted least recently used cache entry");
        }

        debug!(descriptor = %key, "Cached query result");
        true
    }

    /// Evict every entry whose result intersects `graph`. Returns the number evicted.
    pub fn invalidate(&self, graph: &Graph) -> usize {
        self.invalidate_elements(graph.element_keys().map(str::to_string).collect())
    }

    /// Record a mutation of the given element hashes and evict dependent entries.
    pub(crate) fn invalidate_elements(&self, keys: Vec<String>) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let mut state = self.state.lock();

        let mut affected: HashSet<QueryDescriptor> = HashSet::new();
        for key in &keys {
            if let Some(descriptors) = state.dependents.get(key) {
                affected.extend(descriptors.iter().cloned());
            }
        }

        state.generation += 1;
        let generation = state.generation;
        state.mutation_log.push_back((generation, keys));
        while state.mutation_log.len() > MUTATION_LOG_CAPACITY {
            state.mutation_log.pop_front();
        }

        let mut evicted = 0;
        for descriptor in &affected {
            if state.evict(descriptor).is_some() {
                evicted += 1;
            }
        }
        state.counters.invalidations += evicted as u64;

        if evicted > 0 {
            debug!(generation, evicted, "Invalidated cached query results");
        }
        evicted
    }

    /// Monotonic counter of recorded mutations.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn contains(&self, descriptor: &QueryDescriptor) -> bool {
        self.state.lock().entries.contains(descriptor)
    }

    /// Drop every entry. Mutation history is kept so in-flight writes stay checked.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.dependents.clear();
        info!(dropped, "Cleared query result cache");
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock();
        let counters = &state.counters;
        let lookups = counters.hits + counters.misses;
        let hit_ratio = if lookups > 0 {
            counters.hits as f64 / lookups as f64
        } else {
            0.0
        };

        CacheMetrics {
            entries: state.entries.len(),
            capacity: self.capacity.get(),
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            expirations: counters.expirations,
            invalidations: counters.invalidations,
            stale_writes: counters.stale_writes,
            corruptions: counters.corruptions,
            hit_ratio,
        }
    }

    #[cfg(test)]
    fn corrupt_entry(&self, key: &QueryDescriptor, with: QueryDescriptor) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.peek_mut(key) {
            entry.descriptor = with;
        }
    }
}
