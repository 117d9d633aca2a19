//! In-memory indexed view of the hosts table.
//!
//! The store holds an immutable [`Snapshot`] behind an atomic pointer. The
//! synchronizer builds a fresh snapshot on every reload and publishes it with
//! a single pointer swap; queries capture the current snapshot once and read
//! from it for their whole lifetime, so an update landing mid-query never
//! produces a torn view.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::parser::{HealthSpec, Record};

/// One address associated with a hostname in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The address to answer with.
    pub ip: IpAddr,
    /// Per-record TTL override; 0 means "use the zone default".
    pub ttl: u32,
    /// Relative selection weight.
    pub weight: u32,
    /// Optional health check attached to this address.
    pub health: Option<HealthSpec>,
}

/// An immutable publication of the full index.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// hostname -> IPv4 entries
    name4: HashMap<String, Vec<Entry>>,
    /// hostname -> IPv6 entries
    name6: HashMap<String, Vec<Entry>>,
    /// IP text -> hostnames (reverse lookup)
    addr: HashMap<String, Vec<String>>,
    /// source records, kept for counting and target extraction
    records: Vec<Record>,
}

impl Snapshot {
    fn build(records: Vec<Record>) -> Self {
        let mut snapshot = Snapshot {
            records,
            ..Default::default()
        };

        for r in &snapshot.records {
            let entry = Entry {
                ip: r.ip,
                ttl: r.ttl,
                weight: r.weight,
                health: r.health.clone(),
            };
            match r.ip {
                IpAddr::V4(_) => snapshot
                    .name4
                    .entry(r.hostname.clone())
                    .or_default()
                    .push(entry),
                IpAddr::V6(_) => snapshot
                    .name6
                    .entry(r.hostname.clone())
                    .or_default()
                    .push(entry),
            }

            let names = snapshot.addr.entry(r.ip.to_string()).or_default();
            if !names.iter().any(|n| n == &r.hostname) {
                names.push(r.hostname.clone());
            }
        }

        snapshot
    }

    /// IPv4 entries for an exact hostname.
    pub fn lookup_v4(&self, hostname: &str) -> Vec<Entry> {
        lookup_exact(&self.name4, hostname)
    }

    /// IPv6 entries for an exact hostname.
    pub fn lookup_v6(&self, hostname: &str) -> Vec<Entry> {
        lookup_exact(&self.name6, hostname)
    }

    /// IPv4 entries for a hostname, falling back to the best wildcard pattern.
    pub fn lookup_v4_wildcard(&self, hostname: &str) -> Vec<Entry> {
        lookup_with_wildcard(&self.name4, hostname)
    }

    /// IPv6 entries for a hostname, falling back to the best wildcard pattern.
    pub fn lookup_v6_wildcard(&self, hostname: &str) -> Vec<Entry> {
        lookup_with_wildcard(&self.name6, hostname)
    }

    /// Hostnames mapping to the given address text (reverse lookup).
    pub fn lookup_addr(&self, addr: &str) -> Vec<String> {
        let Ok(ip) = addr.parse::<IpAddr>() else {
            return Vec::new();
        };
        self.addr.get(&ip.to_string()).cloned().unwrap_or_default()
    }

    /// Total number of source records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn lookup_exact(m: &HashMap<String, Vec<Entry>>, hostname: &str) -> Vec<Entry> {
    m.get(&normalize(hostname)).cloned().unwrap_or_default()
}

fn lookup_with_wildcard(m: &HashMap<String, Vec<Entry>>, hostname: &str) -> Vec<Entry> {
    let hostname = normalize(hostname);

    if let Some(entries) = m.get(&hostname) {
        return entries.clone();
    }

    match select_best(m.keys().map(String::as_str), &hostname) {
        Some(best) => m[best].clone(),
        None => Vec::new(),
    }
}

/// Pick the best matching wildcard pattern for a hostname.
///
/// Longer patterns win; equal lengths are broken by lexicographic order so
/// selection is deterministic across calls and processes.
fn select_best<'a>(patterns: impl Iterator<Item = &'a str>, hostname: &str) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    for pattern in patterns {
        if !is_wildcard(pattern) || !wildcard_match(pattern, hostname) {
            continue;
        }
        best = match best {
            None => Some(pattern),
            Some(b) if pattern.len() > b.len() || (pattern.len() == b.len() && pattern < b) => {
                Some(pattern)
            }
            other => other,
        };
    }
    best
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.starts_with("*.")
}

/// Whether a single-label wildcard pattern covers a hostname.
/// `*.a.b.` matches `x.a.b.` but neither `x.y.a.b.` nor `a.b.`.
fn wildcard_match(pattern: &str, hostname: &str) -> bool {
    if pattern == hostname {
        return true;
    }
    let Some(suffix) = pattern.strip_prefix('*') else {
        return false;
    };
    let Some(prefix) = hostname.strip_suffix(suffix) else {
        return false;
    };
    !prefix.is_empty() && !prefix.contains('.')
}

fn normalize(hostname: &str) -> String {
    let mut name = hostname.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Thread-safe host index with atomically swappable snapshots.
#[derive(Debug, Clone, Default)]
pub struct HostStore {
    inner: Arc<ArcSwap<Snapshot>>,
}

impl HostStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published snapshot with one built from `records`.
    pub fn update(&self, records: Vec<Record>) {
        let snapshot = Snapshot::build(records);
        debug!(entries = snapshot.len(), "publishing hosts snapshot");
        self.inner.store(Arc::new(snapshot));
    }

    /// Capture the current snapshot. The returned view stays consistent for
    /// as long as the caller holds it, regardless of concurrent updates.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }

    /// Total number of records in the published snapshot.
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    /// Whether the published snapshot holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// IPv4 entries for an exact hostname.
    pub fn lookup_v4(&self, hostname: &str) -> Vec<Entry> {
        self.inner.load().lookup_v4(hostname)
    }

    /// IPv6 entries for an exact hostname.
    pub fn lookup_v6(&self, hostname: &str) -> Vec<Entry> {
        self.inner.load().lookup_v6(hostname)
    }

    /// IPv4 entries for a hostname, wildcard-aware.
    pub fn lookup_v4_wildcard(&self, hostname: &str) -> Vec<Entry> {
        self.inner.load().lookup_v4_wildcard(hostname)
    }

    /// IPv6 entries for a hostname, wildcard-aware.
    pub fn lookup_v6_wildcard(&self, hostname: &str) -> Vec<Entry> {
        self.inner.load().lookup_v6_wildcard(hostname)
    }

    /// Hostnames mapping to the given address text (reverse lookup).
    pub fn lookup_addr(&self, addr: &str) -> Vec<String> {
        self.inner.load().lookup_addr(addr)
    }
}
