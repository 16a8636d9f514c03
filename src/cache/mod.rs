//! Response cache
//!
//! Key/value cache with per-entry TTL and glob invalidation, in the shape of
//! the Redis commands the HTTP layer uses (`GET`, `SETEX`, `KEYS` + `DEL`).
//! The engine itself never touches it.

use crate::{Error, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Default number of cached responses
pub const DEFAULT_CACHE_SIZE: usize = 4096;

/// Cache key of a rendered request path
pub fn response_key(path: &str) -> String {
    format!("cache:{}", path)
}

/// Cache collaborator used around subscription rendering
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Drop every key matching a Redis-style glob. Returns how many went.
    async fn invalidate(&self, pattern: &str) -> Result<usize>;
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    created: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created.elapsed() > self.ttl
    }
}

/// In-process cache with LRU eviction
pub struct MemoryCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        MemoryCache {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Remove expired entries
    pub fn clean_expired(&self) {
        let mut cache = self.cache.lock();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            cache.pop(&key);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
            cache.pop(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            value,
            created: Instant::now(),
            ttl,
        };
        self.cache.lock().put(key.to_string(), entry);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let matcher = glob_to_regex(pattern)?;
        let mut cache = self.cache.lock();
        let keys: Vec<String> = cache
            .iter()
            .filter(|(k, _)| matcher.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            cache.pop(key);
        }
        Ok(keys.len())
    }
}

/// Translate a Redis `KEYS` glob (`*`, `?`, `[...]`, `\` escapes) into an
/// anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            '[' => {
                out.push('[');
                let mut first = true;
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' if !first => {
                            closed = true;
                            break;
                        }
                        '^' if first => out.push('^'),
                        '\\' | '[' | ']' => {
                            out.push('\\');
                            out.push(c);
                        }
                        _ => out.push(c),
                    }
                    first = false;
                }
                if !closed {
                    return Err(Error::validation(format!("unclosed [ in pattern {}", pattern)));
                }
                out.push(']');
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }

    out.push('$');
    Regex::new(&out).map_err(|e| Error::validation(format!("bad pattern {}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("cache:/api/subscriptions*").unwrap();
        assert!(re.is_match("cache:/api/subscriptions"));
        assert!(re.is_match("cache:/api/subscriptions/abc?x=1"));
        assert!(!re.is_match("cache:/api/nodes"));

        let re = glob_to_regex("h?llo").unwrap();
        assert!(re.is_match("hello") && re.is_match("hallo"));
        assert!(!re.is_match("hllo"));

        let re = glob_to_regex("h[ae]llo").unwrap();
        assert!(re.is_match("hallo") && !re.is_match("hillo"));

        let re = glob_to_regex("h[^e]llo").unwrap();
        assert!(re.is_match("hallo") && !re.is_match("hello"));

        let re = glob_to_regex("a\\*b.c").unwrap();
        assert!(re.is_match("a*b.c") && !re.is_match("axb.c") && !re.is_match("a*bxc"));

        assert!(glob_to_regex("h[ae").is_err());
    }

    #[tokio::test]
    async fn test_get_set() {
        let cache = MemoryCache::new(16);
        let key = response_key("/sub/abc");
        cache.set_with_ttl(&key, "body".to_string(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("body"));
        assert_eq!(cache.get("cache:/other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped() {
        let cache = MemoryCache::new(16);
        cache.set_with_ttl("k", "v".to_string(), Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let cache = MemoryCache::new(16);
        let ttl = Duration::from_secs(60);
        for path in ["/api/nodes", "/api/nodes/1", "/api/subscriptions"] {
            cache.set_with_ttl(&response_key(path), path.to_string(), ttl).await.unwrap();
        }

        assert_eq!(cache.invalidate("cache:/api/nodes*").await.unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("cache:/api/subscriptions").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set_with_ttl("a", "1".into(), ttl).await.unwrap();
        cache.set_with_ttl("b", "2".into(), ttl).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set_with_ttl("c", "3".into(), ttl).await.unwrap();

        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("a").await.unwrap().is_some());
        cache.clean_expired();
        assert_eq!(cache.len(), 2);
    }
}
