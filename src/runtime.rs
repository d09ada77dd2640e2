use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::prelude::*;

/// How thorough an optimization pass is. Levels are ordered, a higher level does everything
/// the lower ones do and more.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum OptimizationLevel {
    /// Only strip states that became unreachable.
    Minimal,
    /// Full minimization through equivalence classes.
    #[default]
    Standard,
    /// Minimization plus compilation of the hottest transitions into the dispatch table.
    Aggressive,
    /// Aggressive plus memory compaction, forced when the memory budget is under pressure.
    Maximum,
}

impl Show for OptimizationLevel {
    fn show(&self) -> String {
        match self {
            OptimizationLevel::Minimal => "minimal",
            OptimizationLevel::Standard => "standard",
            OptimizationLevel::Aggressive => "aggressive",
            OptimizationLevel::Maximum => "maximum",
        }
        .to_string()
    }
}

/// The phase the optimizer is in. Triggers move the optimizer from idle to triggered, the
/// scheduling tick picks triggered work up and runs it. Triggers that fire while a pass is
/// running are not lost, their conditions are simply re-evaluated on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerPhase {
    /// No pass is pending or running.
    Idle,
    /// A trigger fired, the next tick will run a pass at the given level.
    Triggered(OptimizationLevel),
    /// A pass is currently running at the given level.
    Running(OptimizationLevel),
}

/// Configuration of a [`Runtime`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Configuration of the transition cache.
    pub cache: CacheConfig,
    /// The level scheduled and adaptive passes run at. Memory pressure escalates past this.
    pub level: OptimizationLevel,
    /// How often a pass is due regardless of traffic. Passes are also never started closer
    /// together than half this interval.
    pub interval: Duration,
    /// How often [`Runtime::tick`] samples the memory footprint and sweeps the cache. Ticks
    /// that fall between two samples only evaluate the pass triggers.
    pub sampling_interval: Duration,
    /// Whether the transition count trigger is armed: when the transitions taken since the
    /// last pass exceed twice the machine size, a pass is requested.
    pub adaptive: bool,
    /// The memory budget in bytes for the machine together with its lookup structures.
    pub max_memory: usize,
    /// The fraction of `max_memory` at which a compacting [`OptimizationLevel::Maximum`] pass
    /// is requested.
    pub compaction_threshold: f64,
    /// How many of the hottest transitions an aggressive pass compiles into dispatch.
    pub compile_budget: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            level: OptimizationLevel::default(),
            interval: Duration::from_secs(30),
            sampling_interval: Duration::from_secs(5),
            adaptive: true,
            max_memory: 64 * 1024 * 1024,
            compaction_threshold: 0.8,
            compile_budget: 32,
        }
    }
}

/// What a single completed optimization pass did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PassSummary {
    /// The level the pass ran at.
    pub level: OptimizationLevel,
    /// States before the pass.
    pub states_before: usize,
    /// States after the pass.
    pub states_after: usize,
    /// The fraction of states the pass removed.
    pub reduction: f64,
    /// Wall clock duration of the pass.
    pub duration: Duration,
    /// Estimated change of the memory footprint in bytes, positive when memory was freed.
    pub memory_delta: i64,
}

/// Live counters of a [`Runtime`]. All counters are atomics, reading them does not contend
/// with the transition path.
#[derive(Debug, Default)]
pub struct OptimizationStats {
    transitions: AtomicU64,
    compiled_hits: AtomicU64,
    minimizations: AtomicU64,
    states_removed: AtomicU64,
    failed_passes: AtomicU64,
    last_pass: Mutex<Option<PassSummary>>,
}

impl OptimizationStats {
    /// Takes a consistent snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transitions: self.transitions.load(Ordering::Relaxed),
            compiled_hits: self.compiled_hits.load(Ordering::Relaxed),
            minimizations: self.minimizations.load(Ordering::Relaxed),
            states_removed: self.states_removed.load(Ordering::Relaxed),
            failed_passes: self.failed_passes.load(Ordering::Relaxed),
            last_pass: *lock(&self.last_pass),
        }
    }

    /// Resets all counters to zero and forgets the last pass.
    pub fn reset(&self) {
        self.transitions.store(0, Ordering::Relaxed);
        self.compiled_hits.store(0, Ordering::Relaxed);
        self.minimizations.store(0, Ordering::Relaxed);
        self.states_removed.store(0, Ordering::Relaxed);
        self.failed_passes.store(0, Ordering::Relaxed);
        *lock(&self.last_pass) = None;
    }

    fn record_pass(&self, summary: PassSummary, minimized: bool) {
        if minimized {
            self.minimizations.fetch_add(1, Ordering::Relaxed);
        }
        self.states_removed.fetch_add(
            (summary.states_before - summary.states_after) as u64,
            Ordering::Relaxed,
        );
        *lock(&self.last_pass) = Some(summary);
    }
}

/// A plain, serializable view of [`OptimizationStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Transitions served since the counters were last reset.
    pub transitions: u64,
    /// Transitions answered by the compiled dispatch table.
    pub compiled_hits: u64,
    /// Completed passes that ran a full minimization.
    pub minimizations: u64,
    /// Total states removed over all passes.
    pub states_removed: u64,
    /// Passes that were aborted because the rebuilt machine failed validation.
    pub failed_passes: u64,
    /// The most recent pass, if any completed.
    pub last_pass: Option<PassSummary>,
}

/// Owns a [`Machine`] and serves transitions while keeping the machine minimal in the
/// background.
///
/// Lookups go through three stages: the compiled [`DispatchTable`], the [`TransitionCache`]
/// and finally the machine itself, with successful raw lookups feeding the cache. Optimization
/// passes work on a private copy of the machine and publish it by swapping an [`Arc`] under a
/// brief write lock, so transitions keep flowing while a pass computes. The cursor is carried
/// through the swap by remapping it into the rebuilt machine.
///
/// Triggers (transition count, elapsed interval, memory pressure) only mark the optimizer as
/// [`OptimizerPhase::Triggered`]; the work itself happens on [`Runtime::tick`], which the
/// owner is expected to call periodically from its scheduling loop.
#[derive(Debug)]
pub struct Runtime<P> {
    machine: RwLock<Arc<Machine<P>>>,
    cursor: Mutex<Option<StateId>>,
    cache: Mutex<TransitionCache>,
    dispatch: RwLock<DispatchTable>,
    stats: OptimizationStats,
    phase: Mutex<OptimizerPhase>,
    pass_lock: Mutex<()>,
    last_pass: Mutex<Instant>,
    last_sample: Mutex<Option<Instant>>,
    since_pass: AtomicU64,
    config: RuntimeConfig,
}

impl<P: Payload> Runtime<P> {
    /// Creates a runtime owning `machine`. The runtime adopts the machine's cursor.
    pub fn new(machine: Machine<P>, config: RuntimeConfig) -> Self {
        let cursor = machine.current();
        Self {
            machine: RwLock::new(Arc::new(machine)),
            cursor: Mutex::new(cursor),
            cache: Mutex::new(TransitionCache::new(config.cache.clone())),
            dispatch: RwLock::new(DispatchTable::new()),
            stats: OptimizationStats::default(),
            phase: Mutex::new(OptimizerPhase::Idle),
            pass_lock: Mutex::new(()),
            last_pass: Mutex::new(Instant::now()),
            last_sample: Mutex::new(None),
            since_pass: AtomicU64::new(0),
            config,
        }
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// A handle to the machine as it currently stands. The handle stays valid across passes,
    /// it simply keeps the pre-pass machine alive.
    pub fn machine(&self) -> Arc<Machine<P>> {
        read(&self.machine).clone()
    }

    /// The current state, if the runtime has one.
    pub fn current(&self) -> Option<StateId> {
        *lock(&self.cursor)
    }

    /// Moves the cursor back to the initial state.
    pub fn restart(&self) {
        let mut cursor = lock(&self.cursor);
        *cursor = Some(self.machine().initial());
    }

    /// Points the cursor at `id` if that state exists, returning whether it did.
    pub fn set_current(&self, id: StateId) -> bool {
        // Validated and stored under the cursor lock, so a pass cannot swap the machine
        // in between.
        let mut cursor = lock(&self.cursor);
        if !self.machine().contains_state(id) {
            return false;
        }
        *cursor = Some(id);
        true
    }

    /// The phase the optimizer is currently in.
    pub fn phase(&self) -> OptimizerPhase {
        *lock(&self.phase)
    }

    /// The live counters of this runtime.
    pub fn stats(&self) -> &OptimizationStats {
        &self.stats
    }

    /// A snapshot of the cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        lock(&self.cache).stats()
    }

    /// The number of compiled dispatch entries.
    pub fn compiled_len(&self) -> usize {
        read(&self.dispatch).len()
    }

    /// The compiled dispatch entries, cloned out for inspection.
    pub fn compiled(&self) -> Vec<(StateId, Label, StateId)> {
        read(&self.dispatch)
            .entries()
            .map(|(s, l, t)| (s, l.clone(), t))
            .collect()
    }

    /// Captures a [`MachineSnapshot`] of the machine as it currently stands, with a fresh
    /// classification and the live counters. The snapshot records the runtime's cursor, not
    /// the one buried in the published machine.
    pub fn snapshot(&self) -> MachineSnapshot<P> {
        // Handle and cursor are captured as a pair under the cursor lock; classification
        // then runs on the captured handle without stalling anyone.
        let (machine, current) = {
            let cursor = lock(&self.cursor);
            (self.machine(), *cursor)
        };
        let classes = classify(machine.as_ref(), machine.initial());
        let mut snapshot =
            MachineSnapshot::capture(&machine, &classes, Some(self.stats.snapshot()));
        snapshot.current = current;
        snapshot
    }

    /// Estimates the combined heap footprint of the machine, the cache and the dispatch table.
    pub fn estimated_memory(&self) -> usize {
        let machine = self.machine();
        machine.estimated_size()
            + lock(&self.cache).estimated_size()
            + read(&self.dispatch).len() * 64
    }

    /// Takes the transition with the given label from the current state, advancing the cursor.
    ///
    /// The lookup cascades through dispatch, cache and machine. A stale dispatch hit (its
    /// target no longer exists, which can happen after [`Runtime::update`]) falls back to the
    /// slower stages silently and disables the pair until the next pass rebuilds the table.
    pub fn transition(&self, label: &str) -> Result<StateId, TransitionError> {
        // The cursor is taken before the machine handle. Passes and updates swap the machine
        // only while holding the cursor, so the pair stays consistent for the whole lookup.
        let mut cursor = lock(&self.cursor);
        let machine = self.machine();
        let current = cursor.ok_or(TransitionError::NoCurrentState)?;
        self.stats.transitions.fetch_add(1, Ordering::Relaxed);
        self.since_pass.fetch_add(1, Ordering::Relaxed);

        // Stage 1: compiled dispatch. The lookup is bound first so the read guard is released
        // before the stale path takes the write lock.
        let compiled = read(&self.dispatch).lookup(current, label);
        if let Some(target) = compiled {
            if machine.contains_state(target) {
                self.stats.compiled_hits.fetch_add(1, Ordering::Relaxed);
                *cursor = Some(target);
                drop(cursor);
                self.evaluate_count_trigger(&machine);
                return Ok(target);
            }
            trace!("stale compiled dispatch for (q{current}, `{label}`), falling back");
            write(&self.dispatch).invalidate(current, label);
        }

        // Stage 2: the cache.
        let mut cache = lock(&self.cache);
        if let Some(target) = cache.lookup(current, label) {
            if self.config.cache.predictive {
                Self::warm_predicted(&machine, &mut cache, target);
            }
            *cursor = Some(target);
            drop(cache);
            drop(cursor);
            self.evaluate_count_trigger(&machine);
            return Ok(target);
        }

        // Stage 3: the machine itself, feeding the cache on success.
        let Some(target) = machine.target(current, label) else {
            return Err(TransitionError::UndefinedTransition {
                state: current,
                label: label.to_string(),
            });
        };
        cache.insert(current, label, target);
        *cursor = Some(target);
        drop(cache);
        drop(cursor);
        self.evaluate_count_trigger(&machine);
        Ok(target)
    }

    /// Applies a mutation to the machine copy-on-write style: the closure runs on a private
    /// clone which then replaces the published machine. The cache is cleared since its entries
    /// may no longer hold; the dispatch table is left alone and validated hit by hit instead.
    /// If the mutation removed the state the cursor was on, the cursor resets to the initial
    /// state.
    pub fn update<F: FnOnce(&mut Machine<P>)>(&self, mutate: F) {
        let snapshot = self.machine();
        let mut work = (*snapshot).clone();
        mutate(&mut work);

        let mut cursor = lock(&self.cursor);
        let mut slot = write(&self.machine);
        let mut cache = lock(&self.cache);
        if let Some(current) = *cursor {
            if !work.contains_state(current) {
                warn!("current state q{current} was removed by an update, restarting");
                *cursor = Some(work.initial());
            }
        }
        cache.clear();
        *slot = Arc::new(work);
    }

    /// Runs one scheduling tick: on the sampling cadence it sweeps the cache and evaluates
    /// the memory trigger, and on every tick it evaluates the elapsed-interval trigger and
    /// executes a pending pass if the rate limit allows. This never blocks on a pass that is
    /// already in flight.
    pub fn tick(&self) {
        let now = Instant::now();
        if self.sample_due(now) {
            lock(&self.cache).maintain();
            let memory = self.estimated_memory();
            if memory as f64 >= self.config.compaction_threshold * self.config.max_memory as f64 {
                debug!(
                    "memory estimate {memory} exceeds {:.0}% of budget {}, requesting compaction",
                    self.config.compaction_threshold * 100.0,
                    self.config.max_memory
                );
                self.request_pass(OptimizationLevel::Maximum);
            }
        }

        if now.duration_since(*lock(&self.last_pass)) >= self.config.interval {
            self.request_pass(self.config.level);
        }

        let pending = match *lock(&self.phase) {
            OptimizerPhase::Triggered(level) => Some(level),
            _ => None,
        };
        if let Some(level) = pending {
            if now.duration_since(*lock(&self.last_pass)) >= self.config.interval / 2 {
                self.run_pass(level);
            } else {
                trace!("pass at level {} deferred by rate limit", level.show());
            }
        }
    }

    /// Forces an optimization pass at the given level, bypassing triggers and the rate limit.
    /// Returns what the pass did, or `None` if another pass was already in flight.
    pub fn optimize_now(&self, level: OptimizationLevel) -> Option<PassSummary> {
        self.run_pass(level)
    }

    fn warm_predicted(machine: &Machine<P>, cache: &mut TransitionCache, state: StateId) {
        let Some(predicted) = cache.predicted(state).cloned() else {
            return;
        };
        if cache.tier_of(state, &predicted).is_some() {
            return;
        }
        if let Some(target) = machine.target(state, &predicted) {
            trace!("warming predicted transition (q{state}, `{predicted}`)");
            cache.insert(state, predicted, target);
        }
    }

    /// Whether the sampling interval has elapsed, updating the sample clock if it has. The
    /// very first tick always samples.
    fn sample_due(&self, now: Instant) -> bool {
        let mut last_sample = lock(&self.last_sample);
        match *last_sample {
            Some(at) if now.duration_since(at) < self.config.sampling_interval => false,
            _ => {
                *last_sample = Some(now);
                true
            }
        }
    }

    fn evaluate_count_trigger(&self, machine: &Machine<P>) {
        if !self.config.adaptive {
            return;
        }
        let since = self.since_pass.load(Ordering::Relaxed);
        if since > 2 * machine.state_count() as u64 {
            self.request_pass(self.config.level);
        }
    }

    fn request_pass(&self, level: OptimizationLevel) {
        let mut phase = lock(&self.phase);
        match *phase {
            OptimizerPhase::Idle => {
                debug!("requesting optimization pass at level {}", level.show());
                *phase = OptimizerPhase::Triggered(level);
            }
            OptimizerPhase::Triggered(existing) if level > existing => {
                debug!("escalating pending pass to level {}", level.show());
                *phase = OptimizerPhase::Triggered(level);
            }
            // Already pending at a sufficient level, or running; the conditions will be seen
            // again on a later tick.
            _ => {}
        }
    }

    fn run_pass(&self, level: OptimizationLevel) -> Option<PassSummary> {
        let _pass = match self.pass_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                trace!("optimization pass already in flight");
                return None;
            }
        };
        *lock(&self.phase) = OptimizerPhase::Running(level);
        let started = Instant::now();
        let memory_before = self.estimated_memory();
        let snapshot = self.machine();
        let states_before = snapshot.state_count();

        // All heavy lifting happens on a private copy, transitions keep flowing.
        let (rebuilt, classes) = match level {
            OptimizationLevel::Minimal => {
                let mut work = (*snapshot).clone();
                prune_unreachable(&mut work);
                (work, None)
            }
            _ => {
                let reduced = minimize(&snapshot);
                (reduced.machine, Some(reduced.classes))
            }
        };

        if !rebuilt.contains_state(rebuilt.initial()) {
            warn!("optimization pass produced a machine without its initial state, keeping the old one");
            self.stats.failed_passes.fetch_add(1, Ordering::Relaxed);
            *lock(&self.phase) = OptimizerPhase::Idle;
            return None;
        }

        // Select what an aggressive pass will compile, remapped into rebuilt handles and
        // validated against the rebuilt machine.
        let compile: Vec<(StateId, Label, StateId)> = if level >= OptimizationLevel::Aggressive {
            lock(&self.cache)
                .hottest(self.config.compile_budget)
                .into_iter()
                .filter_map(|(state, label, target, _)| {
                    let (state, target) = match &classes {
                        Some(classes) => (classes.class_of(state)?, classes.class_of(target)?),
                        None => (state, target),
                    };
                    (rebuilt.target(state, &label) == Some(target))
                        .then_some((state, label, target))
                })
                .collect()
        } else {
            Vec::new()
        };

        // Publish: remap the cursor, swap the machine, drop lookup state derived from the old
        // handles. This is the only section transitions ever wait on.
        {
            let mut cursor = lock(&self.cursor);
            let mut slot = write(&self.machine);
            let mut cache = lock(&self.cache);
            let mut dispatch = write(&self.dispatch);

            *cursor = match (*cursor, &classes) {
                (None, _) => None,
                (Some(old), Some(classes)) => match classes.class_of(old) {
                    Some(class) => Some(class),
                    None => {
                        warn!("current state q{old} did not survive the pass, restarting");
                        Some(rebuilt.initial())
                    }
                },
                (Some(old), None) => {
                    if rebuilt.contains_state(old) {
                        Some(old)
                    } else {
                        warn!("current state q{old} was pruned, restarting");
                        Some(rebuilt.initial())
                    }
                }
            };

            cache.clear();
            dispatch.reset();
            for (state, label, target) in compile {
                dispatch.compile(state, label, target);
            }

            if level == OptimizationLevel::Maximum {
                // The clear above already emptied every tier, cold included; what is left
                // to weigh is the rebuilt machine and whatever was compiled.
                let estimate = rebuilt.estimated_size()
                    + cache.estimated_size()
                    + dispatch.len() * 64;
                if estimate as f64
                    >= self.config.compaction_threshold * self.config.max_memory as f64
                {
                    warn!("memory estimate {estimate} still above budget after compaction, dropping dispatch");
                    dispatch.clear();
                }
            }

            *slot = Arc::new(rebuilt);
        }

        self.since_pass.store(0, Ordering::Relaxed);
        *lock(&self.last_pass) = Instant::now();

        let machine = self.machine();
        let states_after = machine.state_count();
        let summary = PassSummary {
            level,
            states_before,
            states_after,
            reduction: if states_before == 0 {
                0.0
            } else {
                (states_before - states_after) as f64 / states_before as f64
            },
            duration: started.elapsed(),
            memory_delta: memory_before as i64 - self.estimated_memory() as i64,
        };
        self.stats
            .record_pass(summary, level >= OptimizationLevel::Standard);
        info!(
            "optimization pass ({}) rebuilt {} states into {} in {:?}",
            level.show(),
            states_before,
            states_after,
            summary.duration
        );
        *lock(&self.phase) = OptimizerPhase::Idle;
        Some(summary)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
