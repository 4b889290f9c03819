//! TTL cache for results of read-only tools
//!
//! Keys are the tool name plus a canonical rendering of the arguments with
//! object keys sorted, so argument order never affects a lookup. Path-like
//! arguments are remembered per entry so that writes can drop the reads
//! they affect.

use crate::config::CacheConfig;
use crate::utils::shutdown::ShutdownCoordinator;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Argument names that carry filesystem paths
const PATH_ARGUMENTS: &[&str] = &["path", "source", "destination"];

#[derive(Debug, Clone)]
struct CacheEntry {
    tool: String,
    paths: Vec<PathBuf>,
    result: Value,
    cached_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A cache hit
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub result: Value,
    pub age: Duration,
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub insertions: AtomicU64,
}

impl CacheMetrics {
    #[inline]
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub tool: String,
    pub age_secs: u64,
    pub remaining_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    /// Percentage of lookups that hit
    pub hit_rate: f64,
    pub entries: Vec<CacheEntryInfo>,
}

pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    cacheable: HashSet<String>,
    invalidating: HashSet<String>,
    tool_ttl: HashMap<String, Duration>,
    default_ttl: Duration,
    metrics: CacheMetrics,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            cacheable: config.cacheable_tools.iter().cloned().collect(),
            invalidating: config.invalidating_tools.iter().cloned().collect(),
            tool_ttl: config
                .tool_ttl_secs
                .iter()
                .map(|(tool, secs)| (tool.clone(), Duration::from_secs(*secs)))
                .collect(),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            metrics: CacheMetrics::default(),
        }
    }

    pub fn is_cacheable(&self, tool: &str) -> bool {
        self.cacheable.contains(tool)
    }

    /// Whether a successful call to `tool` should invalidate cached reads
    pub fn is_invalidating(&self, tool: &str) -> bool {
        self.invalidating.contains(tool)
    }

    pub fn ttl_for(&self, tool: &str) -> Duration {
        self.tool_ttl.get(tool).copied().unwrap_or(self.default_ttl)
    }

    pub fn cache_key(tool: &str, args: &Value) -> String {
        let mut key = String::with_capacity(tool.len() + 32);
        key.push_str(tool);
        key.push(':');
        write_canonical(args, &mut key);
        key
    }

    pub fn get(&self, tool: &str, args: &Value) -> Option<CachedResult> {
        if !self.is_cacheable(tool) {
            return None;
        }

        let key = Self::cache_key(tool, args);
        let now = Instant::now();
        let hit = match self.entries.get(&key) {
            Some(entry) if !entry.is_expired(now) => Some(CachedResult {
                result: entry.result.clone(),
                age: now.duration_since(entry.cached_at),
            }),
            Some(_) => None,
            None => {
                self.metrics.record_miss();
                return None;
            }
        };

        match hit {
            Some(cached) => {
                self.metrics.record_hit();
                debug!(tool = %tool, "Cache hit ({:?} old)", cached.age);
                Some(cached)
            }
            None => {
                if self
                    .entries
                    .remove_if(&key, |_, entry| entry.is_expired(now))
                    .is_some()
                {
                    self.metrics.record_evictions(1);
                }
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Store a successful result. Returns false when nothing was stored.
    pub fn set(&self, tool: &str, args: &Value, result: &Value) -> bool {
        if !self.is_cacheable(tool) || is_failure(result) {
            return false;
        }

        let now = Instant::now();
        let ttl = self.ttl_for(tool);
        self.entries.insert(
            Self::cache_key(tool, args),
            CacheEntry {
                tool: tool.to_string(),
                paths: path_arguments(args),
                result: result.clone(),
                cached_at: now,
                expires_at: now + ttl,
            },
        );
        self.metrics.record_insertion();
        debug!(tool = %tool, "Cached result for {:?}", ttl);
        true
    }

    /// Drop entries whose path argument lies under or above `pattern`
    pub fn invalidate(&self, pattern: &str) -> usize {
        let target = Path::new(pattern);
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !entry
                .paths
                .iter()
                .any(|path| path.starts_with(target) || target.starts_with(path))
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.metrics.record_evictions(removed);
            debug!("Invalidated {} cache entries for {}", removed, pattern);
        }
        removed
    }

    /// Invalidate every path touched by a successful write-type call
    pub fn invalidate_for(&self, tool: &str, args: &Value) -> usize {
        if !self.is_invalidating(tool) {
            return 0;
        }
        path_arguments(args)
            .iter()
            .map(|path| self.invalidate(&path.to_string_lossy()))
            .sum()
    }

    /// Remove every expired entry
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.metrics.record_evictions(removed);
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        let mut entries: Vec<CacheEntryInfo> = self
            .entries
            .iter()
            .map(|entry| CacheEntryInfo {
                key: entry.key().clone(),
                tool: entry.tool.clone(),
                age_secs: now.duration_since(entry.cached_at).as_secs(),
                remaining_secs: entry.expires_at.saturating_duration_since(now).as_secs(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        CacheStats {
            size: entries.len(),
            hits,
            misses,
            insertions: self.metrics.insertions.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64 * 100.0
            },
            entries,
        }
    }

    /// Sweep expired entries every `interval` until shutdown
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: ShutdownCoordinator,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                    _ = shutdown.wait() => break,
                }
            }
        })
    }
}

/// A result is a failure if it is an object carrying `error`,
/// `success: false` or `isError: true`
pub fn is_failure(result: &Value) -> bool {
    let Some(object) = result.as_object() else {
        return false;
    };
    object.get("error").is_some_and(|e| !e.is_null())
        || object.get("success") == Some(&Value::Bool(false))
        || object.get("isError") == Some(&Value::Bool(true))
}

/// Every path-like argument of a tool call
pub(crate) fn path_arguments(args: &Value) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = PATH_ARGUMENTS
        .iter()
        .filter_map(|name| args.get(*name).and_then(Value::as_str))
        .map(PathBuf::from)
        .collect();
    if let Some(list) = args.get("paths").and_then(Value::as_array) {
        paths.extend(list.iter().filter_map(Value::as_str).map(PathBuf::from));
    }
    paths
}

/// JSON text with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
