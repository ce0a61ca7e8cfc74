//! Per-session path selection.
//!
//! A selector owns the candidate paths of exactly one session and answers
//! "which path now" through [`PathSelector::path`], a lock-free snapshot
//! read. Two policies exist:
//!
//! - [`DefaultSelector`]: adopts the resolver's first path, fails over on
//!   `path_down`, never measures anything.
//! - [`ProbingSelector`]: once started, probes every candidate each
//!   `interval` (at most `active_count` at a time, each bounded by
//!   `timeout`) and prefers the lowest-latency live candidate.
//!
//! ```text
//!            tick                 probes settled
//!   Idle ──────────▶ Probing ─────────────────▶ Evaluating
//!    ▲                                              │
//!    └──────────────────────────────────────────────┘
//!   close() from any state ──▶ Stopped
//! ```

use crate::addr::PathAddr;
use crate::error::{ConfigError, ProbeError};
use crate::path::{Liveness, Path, PathCandidate, PathId};
use crate::resolver::PathProber;
use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Lifecycle of a selector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorState {
    /// Waiting for the next tick
    Idle,
    /// Probe round in flight
    Probing,
    /// Applying probe results
    Evaluating,
    /// Closed; no further activity
    Stopped,
}

/// Path choice for one session
pub trait PathSelector: Send + Sync + fmt::Debug {
    /// Currently preferred path
    fn path(&self) -> Option<Arc<Path>>;

    /// Install the initial candidate set for `remote`
    fn initialize(&self, remote: &PathAddr, paths: Vec<Path>);

    /// Replace the candidate set after a topology update
    fn refresh(&self, paths: Vec<Path>);

    /// Report that a path stopped working
    fn path_down(&self, id: &PathId);

    /// Begin background activity.
    ///
    /// Called once the session is established so the handshake completes
    /// on the path chosen at initialization.
    fn start(&self) {}

    /// Current lifecycle state
    fn state(&self) -> SelectorState;

    /// Watch lifecycle transitions
    fn subscribe(&self) -> watch::Receiver<SelectorState>;

    /// Stop all background activity. Idempotent.
    fn close(&self);
}

/// Active probing parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbingConfig {
    interval: Duration,
    timeout: Duration,
    active_count: usize,
}

impl ProbingConfig {
    /// Validated probing parameters.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` unless `0 < timeout < interval` and
    /// `active_count >= 1`.
    pub fn new(
        interval: Duration,
        timeout: Duration,
        active_count: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            interval,
            timeout,
            active_count,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants.
    ///
    /// # Errors
    ///
    /// See [`ProbingConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.timeout >= self.interval {
            return Err(ConfigError::TimeoutNotBelowInterval {
                timeout: self.timeout,
                interval: self.interval,
            });
        }
        if self.active_count == 0 {
            return Err(ConfigError::ZeroActiveCount);
        }
        Ok(())
    }

    /// Time between probe rounds
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Per-probe timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Maximum concurrent probes per round
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_count
    }
}

/// Which selector a session gets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectorPolicy {
    /// Resolver order, no probing
    #[default]
    Default,
    /// Periodic latency probing
    ActiveProbing(ProbingConfig),
}

impl SelectorPolicy {
    /// Policy from its configuration name (`default` or `probing`).
    ///
    /// Probing parameters are ignored for `default`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unknown names or invalid parameters.
    pub fn from_name(
        name: &str,
        interval: Duration,
        timeout: Duration,
        active_count: usize,
    ) -> Result<Self, ConfigError> {
        match name {
            "default" => Ok(Self::Default),
            "probing" | "active-probing" => Ok(Self::ActiveProbing(ProbingConfig::new(
                interval,
                timeout,
                active_count,
            )?)),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }

    /// Check the policy parameters.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for invalid probing parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Default => Ok(()),
            Self::ActiveProbing(config) => config.validate(),
        }
    }

    /// Build a fresh selector for one session.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for invalid probing parameters.
    pub fn build(&self, prober: Arc<dyn PathProber>) -> Result<Arc<dyn PathSelector>, ConfigError> {
        self.validate()?;
        Ok(match self {
            Self::Default => Arc::new(DefaultSelector::new()),
            Self::ActiveProbing(config) => Arc::new(ProbingSelector::new(*config, prober)),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish(state: &watch::Sender<SelectorState>, next: SelectorState) {
    state.send_if_modified(|current| {
        if *current == SelectorState::Stopped || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Resolver-order selector with failover
#[derive(Debug)]
pub struct DefaultSelector {
    paths: Mutex<Vec<Path>>,
    current: ArcSwapOption<Path>,
    state: watch::Sender<SelectorState>,
}

impl DefaultSelector {
    /// Selector with no paths
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SelectorState::Idle);
        Self {
            paths: Mutex::new(Vec::new()),
            current: ArcSwapOption::empty(),
            state,
        }
    }
}

impl Default for DefaultSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl PathSelector for DefaultSelector {
    fn path(&self) -> Option<Arc<Path>> {
        self.current.load_full()
    }

    fn initialize(&self, remote: &PathAddr, paths: Vec<Path>) {
        tracing::debug!(%remote, count = paths.len(), "default selector initialized");
        self.current.store(paths.first().cloned().map(Arc::new));
        *lock(&self.paths) = paths;
    }

    fn refresh(&self, paths: Vec<Path>) {
        if paths.is_empty() {
            return;
        }
        let keep = self
            .current
            .load()
            .as_ref()
            .and_then(|current| paths.iter().find(|p| p.id == current.id).cloned());
        let next = keep.or_else(|| paths.first().cloned());
        self.current.store(next.map(Arc::new));
        *lock(&self.paths) = paths;
    }

    fn path_down(&self, id: &PathId) {
        let is_current = self
            .current
            .load()
            .as_ref()
            .is_some_and(|current| &current.id == id);
        if !is_current {
            return;
        }
        let paths = lock(&self.paths);
        if let Some(pos) = paths.iter().position(|p| &p.id == id) {
            if paths.len() > 1 {
                let next = paths[(pos + 1) % paths.len()].clone();
                tracing::debug!(down = %id, next = %next.id, "failing over");
                self.current.store(Some(Arc::new(next)));
            }
        }
    }

    fn state(&self) -> SelectorState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SelectorState> {
        self.state.subscribe()
    }

    fn close(&self) {
        self.state.send_replace(SelectorState::Stopped);
    }
}

/// Active probing selector
#[derive(Debug)]
pub struct ProbingSelector {
    shared: Arc<ProbingShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct ProbingShared {
    config: ProbingConfig,
    prober: Arc<dyn PathProber>,
    remote: Mutex<Option<PathAddr>>,
    candidates: Mutex<Vec<PathCandidate>>,
    current: ArcSwapOption<Path>,
    state: watch::Sender<SelectorState>,
}

impl ProbingSelector {
    /// Selector probing through `prober`
    #[must_use]
    pub fn new(config: ProbingConfig, prober: Arc<dyn PathProber>) -> Self {
        let (state, _) = watch::channel(SelectorState::Idle);
        Self {
            shared: Arc::new(ProbingShared {
                config,
                prober,
                remote: Mutex::new(None),
                candidates: Mutex::new(Vec::new()),
                current: ArcSwapOption::empty(),
                state,
            }),
            task: Mutex::new(None),
        }
    }

    /// Snapshot of the candidate set
    #[must_use]
    pub fn candidates(&self) -> Vec<PathCandidate> {
        lock(&self.shared.candidates).clone()
    }

    /// Probing parameters
    #[must_use]
    pub fn config(&self) -> ProbingConfig {
        self.shared.config
    }

    fn spawn_task(&self) {
        // Checked under the task lock so a concurrent close aborts what we spawn
        let mut task = lock(&self.task);
        if task.is_some() || self.state() == SelectorState::Stopped {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(&self.shared);
                *task = Some(handle.spawn(shared.run()));
            }
            Err(_) => tracing::warn!("no async runtime; path probing disabled"),
        }
    }
}

impl PathSelector for ProbingSelector {
    fn path(&self) -> Option<Arc<Path>> {
        self.shared.current.load_full()
    }

    fn initialize(&self, remote: &PathAddr, paths: Vec<Path>) {
        tracing::debug!(
            %remote,
            count = paths.len(),
            interval = ?self.shared.config.interval,
            "probing selector initialized"
        );
        *lock(&self.shared.remote) = Some(remote.clone());
        self.shared
            .current
            .store(paths.first().cloned().map(Arc::new));
        *lock(&self.shared.candidates) = paths.into_iter().map(PathCandidate::new).collect();
    }

    fn refresh(&self, paths: Vec<Path>) {
        if paths.is_empty() {
            return;
        }
        let mut candidates = lock(&self.shared.candidates);
        let merged: Vec<PathCandidate> = paths
            .into_iter()
            .map(|path| {
                match candidates.iter().find(|c| c.path.id == path.id) {
                    Some(existing) => PathCandidate {
                        path,
                        latency: existing.latency,
                        liveness: existing.liveness,
                    },
                    None => PathCandidate::new(path),
                }
            })
            .collect();
        *candidates = merged;

        let current_present = self
            .shared
            .current
            .load()
            .as_ref()
            .is_some_and(|current| candidates.iter().any(|c| c.path.id == current.id));
        if !current_present {
            let next = best_alive(&candidates)
                .or_else(|| candidates.first())
                .map(|c| Arc::new(c.path.clone()));
            self.shared.current.store(next);
        }
    }

    fn path_down(&self, id: &PathId) {
        let mut candidates = lock(&self.shared.candidates);
        if let Some(candidate) = candidates.iter_mut().find(|c| c.id() == id) {
            candidate.mark_dead();
        }
        let is_current = self
            .shared
            .current
            .load()
            .as_ref()
            .is_some_and(|current| &current.id == id);
        if is_current {
            let next = best_alive(&candidates)
                .or_else(|| candidates.iter().find(|c| c.liveness != Liveness::Dead));
            if let Some(next) = next {
                self.shared.current.store(Some(Arc::new(next.path.clone())));
            }
        }
    }

    fn start(&self) {
        self.spawn_task();
    }

    fn state(&self) -> SelectorState {
        *self.shared.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SelectorState> {
        self.shared.state.subscribe()
    }

    fn close(&self) {
        let previous = self.shared.state.send_replace(SelectorState::Stopped);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        if previous != SelectorState::Stopped {
            tracing::debug!("probing selector stopped");
        }
    }
}

impl Drop for ProbingSelector {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl ProbingShared {
    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe_round().await;
        }
    }

    async fn probe_round(&self) {
        let Some(remote) = lock(&self.remote).clone() else {
            return;
        };
        let paths: Vec<Path> = lock(&self.candidates)
            .iter()
            .map(|c| c.path.clone())
            .collect();
        if paths.is_empty() {
            return;
        }

        publish(&self.state, SelectorState::Probing);

        let limit = self.config.active_count.min(paths.len());
        let permits = Arc::new(Semaphore::new(limit));
        let mut probes = JoinSet::new();
        for path in paths {
            let permits = Arc::clone(&permits);
            let prober = Arc::clone(&self.prober);
            let remote = remote.clone();
            let timeout = self.config.timeout;
            probes.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = match tokio::time::timeout(timeout, prober.probe(&remote, &path)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout),
                };
                (path.id, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::debug!("probe task failed: {e}"),
            }
        }

        publish(&self.state, SelectorState::Evaluating);
        self.evaluate(results);
        publish(&self.state, SelectorState::Idle);
    }

    fn evaluate(&self, results: Vec<(PathId, Result<Duration, ProbeError>)>) {
        let mut candidates = lock(&self.candidates);
        for (id, outcome) in results {
            let Some(candidate) = candidates.iter_mut().find(|c| c.id() == &id) else {
                continue;
            };
            match outcome {
                Ok(latency) => {
                    tracing::trace!(path = %id, ?latency, "probe answered");
                    candidate.mark_alive(latency);
                }
                Err(e) => {
                    tracing::trace!(path = %id, "probe failed: {e}");
                    candidate.mark_dead();
                }
            }
        }

        match best_alive(&candidates) {
            Some(best) => {
                let changed = self
                    .current
                    .load()
                    .as_ref()
                    .is_none_or(|current| current.id != best.path.id);
                if changed {
                    tracing::debug!(path = %best.path.id, latency = ?best.latency, "switching preferred path");
                    self.current.store(Some(Arc::new(best.path.clone())));
                }
            }
            None => tracing::debug!("no live candidates; keeping preferred path"),
        }
    }
}

/// Lowest-latency alive candidate, ties broken by identifier
fn best_alive(candidates: &[PathCandidate]) -> Option<&PathCandidate> {
    candidates
        .iter()
        .filter(|c| c.liveness == Liveness::Alive)
        .min_by(|a, b| a.latency.cmp(&b.latency).then_with(|| a.id().cmp(b.id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Prober answering from a script; `None` never answers.
    #[derive(Debug, Default)]
    struct ScriptedProber {
        script: Mutex<HashMap<PathId, Option<Duration>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        per_path: Mutex<HashMap<PathId, usize>>,
        overlapped: AtomicBool,
    }

    impl ScriptedProber {
        fn set(&self, id: &str, latency: Option<Duration>) {
            lock(&self.script).insert(PathId::new(id), latency);
        }
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct PathInFlight<'a>(&'a Mutex<HashMap<PathId, usize>>, PathId);

    impl Drop for PathInFlight<'_> {
        fn drop(&mut self) {
            if let Some(n) = lock(self.0).get_mut(&self.1) {
                *n -= 1;
            }
        }
    }

    #[async_trait]
    impl PathProber for ScriptedProber {
        async fn probe(&self, _remote: &PathAddr, path: &Path) -> Result<Duration, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);
            {
                let mut per_path = lock(&self.per_path);
                let n = per_path.entry(path.id.clone()).or_default();
                *n += 1;
                if *n > 1 {
                    self.overlapped.store(true, Ordering::SeqCst);
                }
            }
            let _path_guard = PathInFlight(&self.per_path, path.id.clone());

            let answer = lock(&self.script).get(&path.id).copied().flatten();
            match answer {
                Some(latency) => {
                    tokio::time::sleep(latency).await;
                    Ok(latency)
                }
                None => std::future::pending().await,
            }
        }
    }

    fn remote() -> PathAddr {
        "1-ff00:0:111,10.0.0.2:8666".parse().unwrap()
    }

    fn path(id: &str) -> Path {
        Path::new("10.0.0.254:30042".parse().unwrap(), vec![]).with_id(id)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn probing(active_count: usize, prober: Arc<ScriptedProber>) -> ProbingSelector {
        let config = ProbingConfig::new(ms(500), ms(400), active_count).unwrap();
        ProbingSelector::new(config, prober)
    }

    fn liveness(selector: &ProbingSelector, id: &str) -> Liveness {
        selector
            .candidates()
            .into_iter()
            .find(|c| c.id().as_str() == id)
            .map(|c| c.liveness)
            .unwrap()
    }

    #[test]
    fn test_probing_config_validation() {
        assert!(ProbingConfig::new(ms(500), ms(400), 2).is_ok());
        assert!(matches!(
            ProbingConfig::new(ms(500), ms(500), 2),
            Err(ConfigError::TimeoutNotBelowInterval { .. })
        ));
        assert!(matches!(
            ProbingConfig::new(ms(500), ms(600), 2),
            Err(ConfigError::TimeoutNotBelowInterval { .. })
        ));
        assert_eq!(
            ProbingConfig::new(Duration::ZERO, ms(1), 1),
            Err(ConfigError::ZeroInterval)
        );
        assert_eq!(
            ProbingConfig::new(ms(500), Duration::ZERO, 1),
            Err(ConfigError::ZeroTimeout)
        );
        assert_eq!(
            ProbingConfig::new(ms(500), ms(400), 0),
            Err(ConfigError::ZeroActiveCount)
        );
    }

    #[test]
    fn test_default_selector_uses_first_path() {
        let selector = DefaultSelector::new();
        assert!(selector.path().is_none());

        selector.initialize(&remote(), vec![path("b"), path("a")]);
        assert_eq!(selector.path().unwrap().id.as_str(), "b");
        assert_eq!(selector.state(), SelectorState::Idle);
    }

    #[test]
    fn test_default_selector_fails_over() {
        let selector = DefaultSelector::new();
        selector.initialize(&remote(), vec![path("a"), path("b"), path("c")]);

        // Not the current path: ignored
        selector.path_down(&PathId::new("c"));
        assert_eq!(selector.path().unwrap().id.as_str(), "a");

        selector.path_down(&PathId::new("a"));
        assert_eq!(selector.path().unwrap().id.as_str(), "b");
    }

    #[test]
    fn test_default_selector_refresh_keeps_current() {
        let selector = DefaultSelector::new();
        selector.initialize(&remote(), vec![path("a"), path("b")]);
        selector.path_down(&PathId::new("a"));

        selector.refresh(vec![path("c"), path("b")]);
        assert_eq!(selector.path().unwrap().id.as_str(), "b");

        selector.refresh(vec![path("d")]);
        assert_eq!(selector.path().unwrap().id.as_str(), "d");

        selector.refresh(vec![]);
        assert_eq!(selector.path().unwrap().id.as_str(), "d");
    }

    #[test]
    fn test_default_selector_close() {
        let selector = DefaultSelector::new();
        let rx = selector.subscribe();
        selector.close();
        assert_eq!(selector.state(), SelectorState::Stopped);
        assert_eq!(*rx.borrow(), SelectorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_prefers_lowest_latency_alive() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set("a", Some(ms(10)));
        prober.set("b", Some(ms(20)));
        prober.set("c", None);
        prober.set("d", None);

        let selector = probing(2, Arc::clone(&prober));
        selector.initialize(&remote(), vec![path("c"), path("d"), path("b"), path("a")]);
        selector.start();
        assert_eq!(selector.path().unwrap().id.as_str(), "c");

        // First round: c,d time out at 400ms, then b,a answer
        tokio::time::sleep(ms(450)).await;
        assert_eq!(selector.path().unwrap().id.as_str(), "a");
        assert_eq!(liveness(&selector, "a"), Liveness::Alive);
        assert_eq!(liveness(&selector, "b"), Liveness::Alive);
        assert_eq!(liveness(&selector, "c"), Liveness::Dead);
        assert_eq!(liveness(&selector, "d"), Liveness::Dead);
        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 2);

        // c recovers and is faster; only promoted after it answers
        prober.set("c", Some(ms(5)));
        assert_eq!(selector.path().unwrap().id.as_str(), "a");
        tokio::time::sleep(ms(500)).await;
        assert_eq!(selector.path().unwrap().id.as_str(), "c");
        assert_eq!(liveness(&selector, "c"), Liveness::Alive);
        assert_eq!(liveness(&selector, "d"), Liveness::Dead);

        selector.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_waits_for_start() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set("a", Some(ms(10)));
        prober.set("b", Some(ms(5)));

        let selector = probing(2, Arc::clone(&prober));
        selector.initialize(&remote(), vec![path("a"), path("b")]);
        tokio::time::sleep(ms(1200)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
        assert_eq!(selector.path().unwrap().id.as_str(), "a");

        selector.start();
        tokio::time::sleep(ms(50)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
        assert_eq!(selector.path().unwrap().id.as_str(), "b");

        // Repeated start keeps a single task
        selector.start();
        tokio::time::sleep(ms(50)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
        selector.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_slow_round_never_overlaps() {
        let prober = Arc::new(ScriptedProber::default());
        for id in ["a", "b", "c", "d"] {
            prober.set(id, None);
        }

        // One path at a time, four timeouts of 400ms: a round takes 1600ms
        let selector = probing(1, Arc::clone(&prober));
        selector.initialize(&remote(), vec![path("a"), path("b"), path("c"), path("d")]);
        selector.start();

        tokio::time::sleep(ms(1550)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 4);
        assert_eq!(selector.state(), SelectorState::Probing);
        assert_eq!(liveness(&selector, "d"), Liveness::Unknown);

        // Round settles at 1600ms; the next starts right after, not before
        tokio::time::sleep(ms(60)).await;
        assert_eq!(liveness(&selector, "a"), Liveness::Dead);
        assert_eq!(liveness(&selector, "d"), Liveness::Dead);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 5);

        tokio::time::sleep(ms(1600)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 9);

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(!prober.overlapped.load(Ordering::SeqCst));
        assert_eq!(selector.path().unwrap().id.as_str(), "a");
        selector.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_ties_break_by_identifier() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set("y", Some(ms(10)));
        prober.set("x", Some(ms(10)));

        let selector = probing(2, Arc::clone(&prober));
        selector.initialize(&remote(), vec![path("y"), path("x")]);
        selector.start();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(selector.path().unwrap().id.as_str(), "x");
        selector.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_all_dead_keeps_previous() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set("a", None);
        prober.set("b", None);

        let selector = probing(2, Arc::clone(&prober));
        selector.initialize(&remote(), vec![path("a"), path("b")]);
        selector.start();
        tokio::time::sleep(ms(450)).await;
        assert_eq!(selector.path().unwrap().id.as_str(), "a");
        assert_eq!(liveness(&selector, "a"), Liveness::Dead);

        prober.set("b", Some(ms(30)));
        tokio::time::sleep(ms(500)).await;
        assert_eq!(selector.path().unwrap().id.as_str(), "b");
        selector.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_close_stops_rounds() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set("a", Some(ms(10)));

        let selector = probing(1, Arc::clone(&prober));
        let mut states = selector.subscribe();
        selector.initialize(&remote(), vec![path("a")]);
        selector.start();
        tokio::time::sleep(ms(1200)).await;
        let calls = prober.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 3);

        selector.close();
        states
            .wait_for(|s| *s == SelectorState::Stopped)
            .await
            .unwrap();
        tokio::time::sleep(ms(2000)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), calls);
        assert_eq!(selector.state(), SelectorState::Stopped);

        // No restart after close
        selector.initialize(&remote(), vec![path("a")]);
        selector.start();
        tokio::time::sleep(ms(1000)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_refresh_merges_state() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set("a", Some(ms(10)));
        prober.set("b", Some(ms(20)));

        let selector = probing(2, Arc::clone(&prober));
        selector.initialize(&remote(), vec![path("a"), path("b")]);
        selector.start();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(selector.path().unwrap().id.as_str(), "a");

        selector.refresh(vec![path("b"), path("e")]);
        assert_eq!(selector.path().unwrap().id.as_str(), "b");
        assert_eq!(liveness(&selector, "b"), Liveness::Alive);
        assert_eq!(liveness(&selector, "e"), Liveness::Unknown);
        selector.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_path_down_switches() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set("a", Some(ms(10)));
        prober.set("b", Some(ms(20)));

        let selector = probing(2, Arc::clone(&prober));
        selector.initialize(&remote(), vec![path("a"), path("b")]);
        selector.start();
        tokio::time::sleep(ms(100)).await;

        selector.path_down(&PathId::new("a"));
        assert_eq!(selector.path().unwrap().id.as_str(), "b");
        assert_eq!(liveness(&selector, "a"), Liveness::Dead);
        selector.close();
    }

    #[tokio::test]
    async fn test_policy_build() {
        let prober: Arc<dyn PathProber> = Arc::new(ScriptedProber::default());
        let selector = SelectorPolicy::default().build(Arc::clone(&prober)).unwrap();
        assert_eq!(selector.state(), SelectorState::Idle);

        let bad = SelectorPolicy::ActiveProbing(ProbingConfig {
            interval: ms(500),
            timeout: ms(500),
            active_count: 1,
        });
        assert!(bad.build(prober).is_err());
    }

    #[test]
    fn test_policy_from_name() {
        assert_eq!(
            SelectorPolicy::from_name("default", ms(0), ms(0), 0),
            Ok(SelectorPolicy::Default)
        );
        assert!(matches!(
            SelectorPolicy::from_name("probing", ms(2000), ms(1000), 2),
            Ok(SelectorPolicy::ActiveProbing(_))
        ));
        assert_eq!(
            SelectorPolicy::from_name("fastest", ms(2000), ms(1000), 2),
            Err(ConfigError::UnknownPolicy("fastest".to_string()))
        );
    }
}
