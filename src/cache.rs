use std::cmp::Reverse;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{math::Map, prelude::*};

/// Ranks entries when the cache must evict. The strategy only decides the order within the
/// eviction pool, which under multi-tier operation is the cold tier as long as it is nonempty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// Evict the entry that was accessed longest ago.
    Lru,
    /// Evict the entry with the fewest accesses, preferring older ones on ties.
    Frequency,
    /// Evict by access count discounted for staleness: entries that have been idle for longer
    /// than the temporal threshold count half.
    #[default]
    Hybrid,
}

/// The temperature of a cache entry. Entries start cold, earn their way up through accesses
/// and drift back down when they go unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTier {
    /// Accessed often and recently, shielded from eviction as long as colder entries exist.
    Hot,
    /// Seen repeated accesses but not enough to count as hot.
    Frequent,
    /// Newly inserted or idle, the pool evictions are drawn from.
    Cold,
}

impl CacheTier {
    fn promoted(self) -> Self {
        match self {
            CacheTier::Cold => CacheTier::Frequent,
            CacheTier::Frequent | CacheTier::Hot => CacheTier::Hot,
        }
    }

    fn demoted(self) -> Self {
        match self {
            CacheTier::Hot => CacheTier::Frequent,
            CacheTier::Frequent | CacheTier::Cold => CacheTier::Cold,
        }
    }
}

impl Show for CacheTier {
    fn show(&self) -> String {
        match self {
            CacheTier::Hot => "hot",
            CacheTier::Frequent => "frequent",
            CacheTier::Cold => "cold",
        }
        .to_string()
    }
}

/// Configuration of a [`TransitionCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// The maximum number of entries. Inserting beyond this evicts.
    pub capacity: usize,
    /// How long an entry may live after its creation, `None` disables expiry.
    pub ttl: Option<Duration>,
    /// The eviction strategy.
    pub strategy: CacheStrategy,
    /// Whether entries are organized into tiers. When disabled, every entry stays cold and
    /// eviction ranks the whole cache.
    pub multi_tier: bool,
    /// Whether the cache keeps per-state label frequencies to predict likely next lookups.
    pub predictive: bool,
    /// How many accesses an entry needs before it is promoted a tier.
    pub promote_threshold: u64,
    /// Recency horizon. Entries idle beyond it are discounted by the hybrid eviction
    /// strategy; entries idle beyond twice it are demoted a tier by
    /// [`TransitionCache::maintain`].
    pub temporal_threshold: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Some(Duration::from_secs(600)),
            strategy: CacheStrategy::default(),
            multi_tier: true,
            predictive: false,
            promote_threshold: 3,
            temporal_threshold: Duration::from_secs(60),
        }
    }
}

/// A point in time view of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of lookups that were answered from the cache.
    pub hits: u64,
    /// Number of lookups that could not be answered.
    pub misses: u64,
    /// Number of entries that were evicted to make room.
    pub evictions: u64,
    /// Number of entries that were dropped because their time to live ran out.
    pub expirations: u64,
    /// The current number of entries.
    pub len: usize,
}

impl CacheStats {
    /// The fraction of lookups that hit, `0.0` if there were none.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    target: StateId,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
    tier: CacheTier,
}

impl Entry {
    fn new(target: StateId, tier: CacheTier, now: Instant) -> Self {
        Self {
            target,
            created_at: now,
            last_access: now,
            access_count: 1,
            tier,
        }
    }

    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match ttl {
            Some(ttl) => now.duration_since(self.created_at) >= ttl,
            None => false,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.access_count += 1;
        self.last_access = now;
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_access)
    }
}

/// Caches `(state, label) -> target` transition lookups. Entries expire after a configurable
/// time to live, are promoted through [`CacheTier`]s as they prove themselves and are evicted
/// by the configured [`CacheStrategy`] once the capacity is exceeded, preferring cold entries.
///
/// With `predictive` enabled the cache additionally maintains per-state frequencies of the
/// labels that were requested, from which [`TransitionCache::predicted`] answers what will
/// most likely be asked next. The runtime uses this to warm entries ahead of time.
#[derive(Debug, Clone)]
pub struct TransitionCache {
    config: CacheConfig,
    entries: Map<StateId, Map<Label, Entry>>,
    len: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    observed: Map<StateId, Map<Label, u64>>,
}

impl Default for TransitionCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl TransitionCache {
    /// Creates an empty cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Map::default(),
            len: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            observed: Map::default(),
        }
    }

    /// The configuration this cache was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The current number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Looks up the cached target of the transition from `state` under `label`. Expired
    /// entries are dropped on access and count as misses.
    pub fn lookup(&mut self, state: StateId, label: &str) -> Option<StateId> {
        let now = Instant::now();
        if self.config.predictive {
            *self
                .observed
                .entry(state)
                .or_default()
                .entry(label.to_string())
                .or_insert(0) += 1;
        }

        let Some(entry) = self.entries.get_mut(&state).and_then(|e| e.get_mut(label)) else {
            self.misses += 1;
            return None;
        };
        if entry.is_expired(self.config.ttl, now) {
            trace!("cache entry (q{state}, `{label}`) expired");
            self.remove(state, label);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        entry.touch(now);
        if self.config.multi_tier && entry.access_count >= self.config.promote_threshold {
            entry.tier = entry.tier.promoted();
        }
        self.hits += 1;
        Some(entry.target)
    }

    /// Inserts (or replaces) the cached target for the transition from `state` under `label`,
    /// evicting if the cache grows beyond its capacity. New entries start cold.
    pub fn insert(&mut self, state: StateId, label: impl Into<Label>, target: StateId) {
        let now = Instant::now();
        let previous = self
            .entries
            .entry(state)
            .or_default()
            .insert(label.into(), Entry::new(target, CacheTier::Cold, now));
        if previous.is_none() {
            self.len += 1;
        }
        self.enforce_capacity(now);
    }

    /// Removes a single entry, returning its cached target.
    pub fn remove(&mut self, state: StateId, label: &str) -> Option<StateId> {
        let per_state = self.entries.get_mut(&state)?;
        let entry = per_state.remove(label)?;
        if per_state.is_empty() {
            self.entries.remove(&state);
        }
        self.len -= 1;
        Some(entry.target)
    }

    /// Drops every entry that involves `state`, i.e. all transitions out of it and all cached
    /// transitions leading into it. Returns how many entries were removed. This is the targeted
    /// invalidation to use when a single state was removed from the underlying machine.
    pub fn invalidate_state(&mut self, state: StateId) -> usize {
        let mut removed = 0;
        if let Some(outgoing) = self.entries.remove(&state) {
            removed += outgoing.len();
        }
        for per_state in self.entries.values_mut() {
            let before = per_state.len();
            per_state.retain(|_, entry| entry.target != state);
            removed += before - per_state.len();
        }
        self.entries.retain(|_, per_state| !per_state.is_empty());
        self.len -= removed;
        self.observed.remove(&state);
        removed
    }

    /// Drops all entries and prediction data, the counters survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.observed.clear();
        self.len = 0;
    }

    /// Drops all entries of the given tier, returning how many there were. Memory compaction
    /// uses this to shed the cold tier.
    pub fn clear_tier(&mut self, tier: CacheTier) -> usize {
        let mut removed = 0;
        for per_state in self.entries.values_mut() {
            let before = per_state.len();
            per_state.retain(|_, entry| entry.tier != tier);
            removed += before - per_state.len();
        }
        self.entries.retain(|_, per_state| !per_state.is_empty());
        self.len -= removed;
        removed
    }

    /// Sweeps the cache once: expired entries are dropped and entries that have been idle for
    /// twice the temporal threshold are demoted a tier. Returns the number of dropped entries.
    /// The runtime calls this on its scheduling tick.
    pub fn maintain(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for per_state in self.entries.values_mut() {
            let before = per_state.len();
            per_state.retain(|_, entry| !entry.is_expired(self.config.ttl, now));
            removed += before - per_state.len();
            if self.config.multi_tier {
                for entry in per_state.values_mut() {
                    if entry.idle_for(now) >= self.config.temporal_threshold * 2 {
                        entry.tier = entry.tier.demoted();
                    }
                }
            }
        }
        self.entries.retain(|_, per_state| !per_state.is_empty());
        self.len -= removed;
        self.expirations += removed as u64;
        removed
    }

    /// The tier of the entry for the given transition, if it is cached.
    pub fn tier_of(&self, state: StateId, label: &str) -> Option<CacheTier> {
        Some(self.entries.get(&state)?.get(label)?.tier)
    }

    /// The label most frequently requested from `state`, if prediction is enabled and the
    /// state has been looked up before. Ties resolve to the lexicographically smaller label.
    pub fn predicted(&self, state: StateId) -> Option<&Label> {
        self.observed
            .get(&state)?
            .iter()
            .max_by(|(la, ca), (lb, cb)| ca.cmp(cb).then_with(|| lb.cmp(la)))
            .map(|(label, _)| label)
    }

    /// A snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            len: self.len,
        }
    }

    /// Estimates the heap footprint of the cache in bytes.
    pub fn estimated_size(&self) -> usize {
        let entry_bytes = std::mem::size_of::<Entry>() + 32;
        let observed: usize = self
            .observed
            .values()
            .map(|per_state| per_state.len() * 40)
            .sum();
        self.len * entry_bytes + observed
    }

    /// Iterates over the cached transitions together with their access counts, hottest first.
    /// The runtime compiles the leading entries of this ranking into its dispatch table.
    pub fn hottest(&self, count: usize) -> Vec<(StateId, Label, StateId, u64)> {
        use itertools::Itertools;
        self.entries
            .iter()
            .flat_map(|(state, per_state)| {
                per_state
                    .iter()
                    .map(|(label, entry)| (*state, label.clone(), entry.target, entry.access_count))
            })
            .sorted_by(|a, b| {
                b.3.cmp(&a.3)
                    .then_with(|| a.0.cmp(&b.0))
                    .then_with(|| a.1.cmp(&b.1))
            })
            .take(count)
            .collect()
    }

    fn enforce_capacity(&mut self, now: Instant) {
        while self.len > self.config.capacity {
            let pool_tier = if self.config.multi_tier
                && self
                    .entries
                    .values()
                    .flat_map(|per_state| per_state.values())
                    .any(|entry| entry.tier == CacheTier::Cold)
            {
                Some(CacheTier::Cold)
            } else {
                None
            };

            let victim = self
                .entries
                .iter()
                .flat_map(|(state, per_state)| {
                    per_state.iter().map(move |(label, entry)| (*state, label, entry))
                })
                .filter(|(_, _, entry)| pool_tier.map_or(true, |tier| entry.tier == tier))
                .min_by_key(|(state, label, entry)| self.eviction_key(entry, now, *state, label))
                .map(|(state, label, _)| (state, label.clone()));

            let Some((state, label)) = victim else {
                return;
            };
            trace!("evicting cache entry (q{state}, `{label}`)");
            self.remove(state, &label);
            self.evictions += 1;
        }
    }

    fn eviction_key(
        &self,
        entry: &Entry,
        now: Instant,
        state: StateId,
        label: &Label,
    ) -> (u64, Instant, Reverse<u64>, StateId, Label) {
        match self.config.strategy {
            CacheStrategy::Lru => (0, entry.last_access, Reverse(entry.access_count), state, label.clone()),
            CacheStrategy::Frequency => {
                (entry.access_count, entry.created_at, Reverse(0), state, label.clone())
            }
            CacheStrategy::Hybrid => {
                let effective = if entry.idle_for(now) > self.config.temporal_threshold {
                    entry.access_count / 2
                } else {
                    entry.access_count
                };
                (effective, entry.last_access, Reverse(0), state, label.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            capacity: 8,
            ttl: None,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn hits_misses_and_stats() {
        let mut cache = TransitionCache::new(config());
        assert_eq!(cache.lookup(0, "a"), None);
        cache.insert(0, "a", 1);
        assert_eq!(cache.lookup(0, "a"), Some(1));
        assert_eq!(cache.lookup(0, "b"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.len, 1);
        assert!((stats.hit_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let mut cache = TransitionCache::new(CacheConfig {
            ttl: Some(Duration::ZERO),
            ..config()
        });
        cache.insert(0, "a", 1);
        assert_eq!(cache.lookup(0, "a"), None);
        assert!(cache.is_empty());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn maintain_sweeps_expired_entries() {
        let mut cache = TransitionCache::new(CacheConfig {
            ttl: Some(Duration::ZERO),
            ..config()
        });
        cache.insert(0, "a", 1);
        cache.insert(0, "b", 2);
        cache.insert(1, "a", 0);
        assert_eq!(cache.maintain(), 3);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 3);
    }

    #[test]
    fn capacity_is_enforced_by_eviction() {
        let mut cache = TransitionCache::new(CacheConfig {
            capacity: 2,
            multi_tier: false,
            strategy: CacheStrategy::Frequency,
            ..config()
        });
        cache.insert(0, "a", 1);
        cache.insert(0, "b", 2);
        // Entry (0, a) proves itself, (0, b) stays at a single access.
        assert_eq!(cache.lookup(0, "a"), Some(1));
        assert_eq!(cache.lookup(0, "a"), Some(1));

        cache.insert(1, "c", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        // The least frequently used entry went away.
        assert!(cache.tier_of(0, "b").is_none());
        assert!(cache.tier_of(0, "a").is_some());
        assert!(cache.tier_of(1, "c").is_some());
    }

    #[test]
    fn filling_past_capacity_drops_the_oldest() {
        let mut cache = TransitionCache::new(CacheConfig {
            capacity: 2,
            ..config()
        });
        cache.insert(0, "a", 1);
        cache.insert(1, "b", 2);
        cache.insert(2, "c", 3);

        // Nothing was ever read back, so the first entry in is the first out.
        assert_eq!(cache.lookup(0, "a"), None);
        assert_eq!(cache.lookup(1, "b"), Some(2));
        assert_eq!(cache.lookup(2, "c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn lru_evicts_the_longest_unseen_entry() {
        let mut cache = TransitionCache::new(CacheConfig {
            capacity: 1,
            multi_tier: false,
            strategy: CacheStrategy::Lru,
            ..config()
        });
        cache.insert(0, "a", 1);
        cache.insert(1, "b", 2);
        assert!(cache.tier_of(0, "a").is_none());
        assert!(cache.tier_of(1, "b").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn repeated_access_promotes_toward_hot() {
        let mut cache = TransitionCache::new(config());
        cache.insert(0, "a", 1);
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Cold));

        cache.lookup(0, "a");
        cache.lookup(0, "a");
        // Third access overall, the promote threshold.
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Frequent));
        cache.lookup(0, "a");
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Hot));
    }

    #[test]
    fn eviction_prefers_the_cold_tier() {
        let mut cache = TransitionCache::new(CacheConfig {
            capacity: 2,
            ..config()
        });
        cache.insert(0, "a", 1);
        cache.lookup(0, "a");
        cache.lookup(0, "a");
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Frequent));

        cache.insert(3, "b", 4);
        cache.insert(9, "z", 5);
        assert_eq!(cache.len(), 2);
        // The promoted entry is shielded, one of the cold ones had to go.
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Frequent));
        assert!(cache.tier_of(3, "b").is_none());
        assert!(cache.tier_of(9, "z").is_some());
    }

    #[test]
    fn idle_entries_are_demoted_by_maintenance() {
        let mut cache = TransitionCache::new(CacheConfig {
            temporal_threshold: Duration::ZERO,
            ..config()
        });
        cache.insert(0, "a", 1);
        cache.lookup(0, "a");
        cache.lookup(0, "a");
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Frequent));

        // With a zero threshold every entry counts as idle on the next sweep.
        cache.maintain();
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Cold));
    }

    #[test]
    fn prediction_tracks_requested_labels() {
        let mut cache = TransitionCache::new(CacheConfig {
            predictive: true,
            ..config()
        });
        assert_eq!(cache.predicted(7), None);
        cache.lookup(7, "x");
        cache.lookup(7, "y");
        cache.lookup(7, "x");
        cache.lookup(7, "x");
        assert_eq!(cache.predicted(7).map(|l| l.as_str()), Some("x"));
        // Untracked states stay unpredicted.
        assert_eq!(cache.predicted(8), None);
    }

    #[test]
    fn invalidating_a_state_drops_both_directions() {
        let mut cache = TransitionCache::new(config());
        cache.insert(1, "a", 2);
        cache.insert(2, "b", 3);
        cache.insert(3, "c", 1);
        assert_eq!(cache.invalidate_state(2), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.tier_of(3, "c").is_some());
    }

    #[test]
    fn clearing_the_cold_tier_spares_promoted_entries() {
        let mut cache = TransitionCache::new(config());
        cache.insert(0, "a", 1);
        cache.lookup(0, "a");
        cache.lookup(0, "a");
        cache.insert(0, "b", 2);
        cache.insert(5, "c", 3);

        assert_eq!(cache.clear_tier(CacheTier::Cold), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.tier_of(0, "a"), Some(CacheTier::Frequent));
    }

    #[test]
    fn hottest_ranks_by_access_count() {
        let mut cache = TransitionCache::new(config());
        cache.insert(0, "a", 1);
        cache.insert(1, "b", 2);
        cache.insert(2, "c", 3);
        cache.lookup(1, "b");
        cache.lookup(1, "b");
        cache.lookup(2, "c");

        let ranking = cache.hottest(2);
        assert_eq!(ranking.len(), 2);
        assert_eq!((ranking[0].0, ranking[0].3), (1, 3));
        assert_eq!((ranking[1].0, ranking[1].3), (2, 2));
    }
}
