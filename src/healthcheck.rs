//! Active health checking with a hysteresis cache.
//!
//! The [`Checker`] periodically probes every record that carries a health
//! spec and funnels the results into a [`HealthCache`]. Status flips are
//! debounced: a target must fail `failures_before_down` consecutive probes to
//! leave service and succeed `successes_before_up` consecutive probes to
//! return, so a single lost packet cannot flap an address out of rotation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::DnsError;
use crate::parser::{HealthSpec, Record};
use crate::probe::{ProbeSet, TargetProber};

/// Default probe interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
/// Default per-probe timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Default cap on concurrently running probes.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
/// Default consecutive failures before a target is marked down.
pub const DEFAULT_FAILURES_BEFORE_DOWN: u32 = 3;
/// Default consecutive successes before a target is marked up.
pub const DEFAULT_SUCCESSES_BEFORE_UP: u32 = 1;

/// What the handler should do when every entry for a name is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyPolicy {
    /// Ignore health and answer with all addresses; any answer beats none.
    #[default]
    ReturnAll,
    /// Answer with nothing.
    ReturnEmpty,
    /// Let the next stage handle the query.
    Fallthrough,
}

/// Health checker configuration.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Sweep interval.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Maximum concurrently running probes.
    pub max_concurrent: usize,
    /// Staleness horizon for cache entries; defaults to `2 * interval`.
    pub cache_ttl: Duration,
    /// Consecutive failures before a target is marked unhealthy.
    pub failures_before_down: u32,
    /// Consecutive successes before a target is marked healthy.
    pub successes_before_up: u32,
    /// Policy for names whose entries are all unhealthy.
    pub unhealthy_policy: UnhealthyPolicy,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            cache_ttl: DEFAULT_INTERVAL * 2,
            failures_before_down: DEFAULT_FAILURES_BEFORE_DOWN,
            successes_before_up: DEFAULT_SUCCESSES_BEFORE_UP,
            unhealthy_policy: UnhealthyPolicy::ReturnAll,
        }
    }
}

/// Cache key identifying one probe target.
pub fn health_key(hostname: &str, ip: IpAddr) -> String {
    format!("{hostname}|{ip}")
}

/// Per-target health state.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Current verdict.
    pub healthy: bool,
    /// When the target was last probed.
    pub last_check: Instant,
    /// Consecutive failures observed.
    pub failures: u32,
    /// Consecutive successes observed.
    pub successes: u32,
}

/// Thread-safe map of probe targets to hysteresis state.
///
/// Unknown keys read as healthy, so a freshly added target keeps serving
/// until probes prove otherwise.
#[derive(Debug, Clone)]
pub struct HealthCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl HealthCache {
    /// Create a cache whose entries go stale after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Current verdict for a key, or `None` when it was never probed.
    pub fn get(&self, key: &str) -> Option<bool> {
        self.entries.read().get(key).map(|e| e.healthy)
    }

    /// Current verdict for a key; unknown keys are healthy.
    pub fn is_healthy(&self, key: &str) -> bool {
        self.get(key).unwrap_or(true)
    }

    /// Feed one probe result through the hysteresis state machine.
    pub fn update(&self, key: &str, healthy: bool, failures_before_down: u32, successes_before_up: u32) {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_insert_with(|| CacheEntry {
            healthy: true,
            last_check: Instant::now(),
            failures: 0,
            successes: 0,
        });

        entry.last_check = Instant::now();
        if healthy {
            entry.failures = 0;
            entry.successes += 1;
            if entry.successes >= successes_before_up {
                entry.healthy = true;
            }
        } else {
            entry.successes = 0;
            entry.failures += 1;
            if entry.failures >= failures_before_down {
                entry.healthy = false;
            }
        }
    }

    /// Whether the entry is older than the cache TTL (or missing).
    /// Diagnostic only; the verdict stays authoritative while stale.
    pub fn is_stale(&self, key: &str) -> bool {
        match self.entries.read().get(key) {
            Some(e) => e.last_check.elapsed() > self.ttl,
            None => true,
        }
    }

    /// Copy of the full state for a key.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// All keys currently tracked.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Drop one key.
    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Drop all keys.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// One probe target extracted from a record with a health spec.
#[derive(Debug, Clone)]
pub struct Target {
    /// Hostname the record belongs to.
    pub hostname: String,
    /// Address to probe.
    pub ip: IpAddr,
    /// How to probe it.
    pub spec: HealthSpec,
}

impl Target {
    /// Cache key for this target.
    pub fn key(&self) -> String {
        health_key(&self.hostname, self.ip)
    }
}

/// Periodic scheduler driving probes into the cache.
pub struct Checker {
    cfg: CheckerConfig,
    cache: HealthCache,
    targets: RwLock<Vec<Target>>,
    prober: Arc<dyn TargetProber>,
    running: AtomicBool,
}

impl Checker {
    /// Create a checker with the default probe set.
    pub fn new(cfg: CheckerConfig) -> Result<Self, DnsError> {
        let prober = Arc::new(ProbeSet::new(cfg.timeout)?);
        Ok(Self::with_prober(cfg, prober))
    }

    /// Create a checker with a custom prober (used by tests).
    pub fn with_prober(cfg: CheckerConfig, prober: Arc<dyn TargetProber>) -> Self {
        let cache = HealthCache::new(cfg.cache_ttl);
        Self {
            cfg,
            cache,
            targets: RwLock::new(Vec::new()),
            prober,
            running: AtomicBool::new(false),
        }
    }

    /// Replace the target set with the health-checked subset of `records`.
    pub fn update_targets(&self, records: &[Record]) {
        let targets: Vec<Target> = records
            .iter()
            .filter_map(|r| {
                r.health.as_ref().map(|spec| Target {
                    hostname: r.hostname.clone(),
                    ip: r.ip,
                    spec: spec.clone(),
                })
            })
            .collect();
        debug!(targets = targets.len(), "health targets updated");
        *self.targets.write() = targets;
    }

    /// Verdict for one hostname/address pair; unprobed pairs are healthy.
    pub fn is_healthy(&self, hostname: &str, ip: IpAddr) -> bool {
        self.cache.is_healthy(&health_key(hostname, ip))
    }

    /// The configured policy for all-unhealthy names.
    pub fn policy(&self) -> UnhealthyPolicy {
        self.cfg.unhealthy_policy
    }

    /// The underlying cache, for inspection.
    pub fn cache(&self) -> &HealthCache {
        &self.cache
    }

    /// Whether the sweep loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of targets currently scheduled.
    pub fn target_count(&self) -> usize {
        self.targets.read().len()
    }

    /// Run sweeps until `cancel` fires. A second call while running is a
    /// no-op; in-flight probes finish before the call returns.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            interval = ?self.cfg.interval,
            max_concurrent = self.cfg.max_concurrent,
            "health checker started"
        );

        // First sweep runs immediately so a fresh process converges fast.
        self.sweep(&cancel).await;

        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep(&cancel).await,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("health checker stopped");
    }

    /// Probe every target once, bounded by the concurrency cap. Cancellation
    /// drops pending dispatches but waits for in-flight probes.
    async fn sweep(&self, cancel: &CancellationToken) {
        let targets = self.targets.read().clone();
        if targets.is_empty() {
            return;
        }

        let sem = Arc::new(Semaphore::new(self.cfg.max_concurrent));
        let mut join = JoinSet::new();

        for target in targets {
            if cancel.is_cancelled() {
                break;
            }

            let sem = sem.clone();
            let cancel = cancel.clone();
            let prober = self.prober.clone();
            let cache = self.cache.clone();
            let timeout = self.cfg.timeout;
            let down = self.cfg.failures_before_down;
            let up = self.cfg.successes_before_up;

            join.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    permit = sem.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                };

                let healthy = match tokio::time::timeout(timeout, prober.probe(&target)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        debug!(target = %target.key(), %err, "probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(target = %target.key(), "probe timed out");
                        false
                    }
                };

                cache.update(&target.key(), healthy, down, up);
            });
        }

        while join.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DnsError;
    use crate::parser::parse_records;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const TTL: Duration = Duration::from_secs(20);

    #[test]
    fn test_cache_unknown_key_is_healthy() {
        let cache = HealthCache::new(TTL);
        assert!(cache.is_healthy("svc.example.com.|10.0.0.1"));
        assert!(cache.get("svc.example.com.|10.0.0.1").is_none());
    }

    #[test]
    fn test_cache_needs_consecutive_failures_to_go_down() {
        let cache = HealthCache::new(TTL);
        let key = "svc.example.com.|10.0.0.1";

        cache.update(key, false, 3, 1);
        cache.update(key, false, 3, 1);
        assert!(cache.is_healthy(key));

        cache.update(key, false, 3, 1);
        assert!(!cache.is_healthy(key));
    }

    #[test]
    fn test_cache_success_resets_failure_streak() {
        let cache = HealthCache::new(TTL);
        let key = "svc.example.com.|10.0.0.1";

        cache.update(key, false, 3, 1);
        cache.update(key, false, 3, 1);
        cache.update(key, true, 3, 1);
        cache.update(key, false, 3, 1);
        cache.update(key, false, 3, 1);
        assert!(cache.is_healthy(key));
    }

    #[test]
    fn test_cache_needs_consecutive_successes_to_come_up() {
        let cache = HealthCache::new(TTL);
        let key = "svc.example.com.|10.0.0.1";

        for _ in 0..3 {
            cache.update(key, false, 3, 2);
        }
        assert!(!cache.is_healthy(key));

        cache.update(key, true, 3, 2);
        assert!(!cache.is_healthy(key));
        cache.update(key, true, 3, 2);
        assert!(cache.is_healthy(key));
    }

    #[test]
    fn test_cache_introspection() {
        let cache = HealthCache::new(TTL);
        cache.update("a|10.0.0.1", true, 3, 1);
        cache.update("b|10.0.0.2", false, 1, 1);

        assert_eq!(cache.len(), 2);
        assert!(!cache.is_stale("a|10.0.0.1"));
        assert!(cache.is_stale("missing"));

        let entry = cache.entry("b|10.0.0.2").unwrap();
        assert!(!entry.healthy);
        assert_eq!(entry.failures, 1);

        cache.delete("a|10.0.0.1");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    struct ScriptedProber {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedProber {
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TargetProber for ScriptedProber {
        async fn probe(&self, _target: &Target) -> Result<(), DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DnsError::Probe("scripted failure".into()))
            }
        }
    }

    fn fast_config() -> CheckerConfig {
        CheckerConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(50),
            cache_ttl: Duration::from_millis(40),
            ..CheckerConfig::default()
        }
    }

    #[test]
    fn test_update_targets_keeps_only_health_checked_records() {
        let checker = Checker::new(CheckerConfig::default()).unwrap();
        let records = parse_records(
            b"10.0.0.1 plain.example.com\n10.0.0.2 svc.example.com # +etcdhosts hc=tcp:3306",
        );
        checker.update_targets(&records);
        assert_eq!(checker.target_count(), 1);
    }

    #[tokio::test]
    async fn test_checker_marks_target_down_after_threshold() {
        let prober = ScriptedProber::failing();
        let checker = Arc::new(Checker::with_prober(fast_config(), prober.clone()));
        let records = parse_records(b"10.0.0.1 svc.example.com # +etcdhosts hc=tcp:3306");
        checker.update_targets(&records);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(checker.clone().run(cancel.clone()));

        // Plenty of 20ms sweeps to cross failures_before_down = 3.
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(prober.calls() >= 3, "expected >=3 sweeps, got {}", prober.calls());
        assert!(!checker.is_healthy("svc.example.com.", "10.0.0.1".parse().unwrap()));
        assert!(!checker.is_running());
    }

    #[tokio::test]
    async fn test_checker_recovers_after_success() {
        let prober = ScriptedProber::failing();
        let checker = Arc::new(Checker::with_prober(fast_config(), prober.clone()));
        let records = parse_records(b"10.0.0.1 svc.example.com # +etcdhosts hc=tcp:3306");
        checker.update_targets(&records);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(checker.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!checker.is_healthy("svc.example.com.", ip));

        prober.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap();

        // successes_before_up = 1: a single good probe restores service.
        assert!(checker.is_healthy("svc.example.com.", ip));
    }

    #[tokio::test]
    async fn test_checker_start_is_idempotent() {
        let prober = ScriptedProber::failing();
        let checker = Arc::new(Checker::with_prober(fast_config(), prober));
        let cancel = CancellationToken::new();

        let first = tokio::spawn(checker.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(checker.is_running());

        // Second run returns immediately without touching the loop.
        checker.clone().run(cancel.clone()).await;
        assert!(checker.is_running());

        cancel.cancel();
        first.await.unwrap();
        assert!(!checker.is_running());
    }

    #[tokio::test]
    async fn test_checker_unknown_pair_defaults_healthy() {
        let checker = Checker::new(CheckerConfig::default()).unwrap();
        assert!(checker.is_healthy("never-probed.example.com.", "10.9.9.9".parse().unwrap()));
    }
}
