use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use http::{Method, Uri};

use crate::response::Response;
use crate::util::lock_unpoisoned;

/// TTL and capacity bounds for a [`ResponseCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    ttl: Duration,
    max_entries: usize,
}

impl CachePolicy {
    pub fn new(ttl: Duration) -> Self {
        CachePolicy {
            ttl,
            max_entries: 256,
        }
    }

    /// Five minutes, 256 entries.
    pub fn standard() -> Self {
        CachePolicy::new(Duration::from_secs(300))
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn ttl_value(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries_value(&self) -> usize {
        self.max_entries
    }
}

struct CacheEntry {
    response: Response,
    stored_at: Instant,
    last_used_at: Instant,
}

/// Response cache keyed by method and full URL. Only successful GET
/// responses are stored; the client consults it before rate limiting so a
/// hit spends no tokens.
///
/// Expired entries are dropped on access. When the cache is full, the
/// least recently used entry is evicted first.
pub struct ResponseCache {
    policy: CachePolicy,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(policy: CachePolicy) -> Self {
        ResponseCache {
            policy,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub(crate) fn lookup(&self, key: &str) -> Option<Response> {
        let now = Instant::now();
        let mut entries = lock_unpoisoned(&self.entries);
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.stored_at) <= self.policy.ttl => {
                entry.last_used_at = now;
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn store(&self, key: String, response: Response) {
        let now = Instant::now();
        let mut entries = lock_unpoisoned(&self.entries);
        entries.retain(|_, entry| now.duration_since(entry.stored_at) <= self.policy.ttl);
        entries.insert(
            key,
            CacheEntry {
                response,
                stored_at: now,
                last_used_at: now,
            },
        );
        while entries.len() > self.policy.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Drops every entry.
    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn cache_key(method: &Method, url: &Uri) -> String {
    format!("{method} {url}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use std::thread;

    fn response(url: &str, body: &str) -> Response {
        Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from(body.to_string()),
            Duration::from_millis(2),
            1,
            Request::test_stub(Method::GET, url),
        )
    }

    #[test]
    fn stored_responses_are_returned_until_ttl() {
        let cache = ResponseCache::new(CachePolicy::new(Duration::from_millis(50)));
        cache.store("GET https://a/x".to_string(), response("https://a/x", "hit"));

        let hit = cache.lookup("GET https://a/x").unwrap();
        assert_eq!(hit.text(), "hit");

        thread::sleep(Duration::from_millis(70));
        assert!(cache.lookup("GET https://a/x").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache =
            ResponseCache::new(CachePolicy::new(Duration::from_secs(60)).max_entries(2));
        cache.store("GET https://a/1".to_string(), response("https://a/1", "1"));
        thread::sleep(Duration::from_millis(5));
        cache.store("GET https://a/2".to_string(), response("https://a/2", "2"));
        thread::sleep(Duration::from_millis(5));

        // Touch entry 1 so entry 2 becomes the eviction candidate.
        assert!(cache.lookup("GET https://a/1").is_some());
        thread::sleep(Duration::from_millis(5));
        cache.store("GET https://a/3".to_string(), response("https://a/3", "3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("GET https://a/1").is_some());
        assert!(cache.lookup("GET https://a/2").is_none());
        assert!(cache.lookup("GET https://a/3").is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = ResponseCache::new(CachePolicy::standard());
        cache.store("GET https://a/1".to_string(), response("https://a/1", "1"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_distinguish_method_and_url() {
        let get = cache_key(&Method::GET, &"https://a/x".parse().unwrap());
        let head = cache_key(&Method::HEAD, &"https://a/x".parse().unwrap());
        assert_ne!(get, head);
    }
}
