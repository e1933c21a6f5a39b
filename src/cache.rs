//! # Resolution cache
//!
//! Last-known-good records per plan entry. When the backend is down during
//! a refresh, the rotation loop serves from here instead of wiping files
//! that were valid a minute ago, up to a configurable maximum age.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::vault::ResolvedSecret;

/// One cached resolution: the records an entry produced and when.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub secrets: Vec<ResolvedSecret>,
    pub fetched_at: Instant,
}

/// Entry-keyed store of the most recent successful resolutions.
///
/// Entries are replaced wholesale on every successful tick; staleness is
/// judged only against `max_age` at read time. Lock scope stays inside
/// each method, never across an await.
#[derive(Debug)]
pub struct ResolutionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_age: Duration,
}

impl ResolutionCache {
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    /// Store the latest successful resolution for one plan entry.
    pub fn put(&self, key: &str, secrets: Vec<ResolvedSecret>) {
        let entry = CacheEntry {
            secrets,
            fetched_at: Instant::now(),
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), entry);
        }
    }

    /// Clone out the cached records for one entry if they are still within
    /// the maximum age.
    #[must_use]
    pub fn get_fresh(&self, key: &str) -> Option<Vec<ResolvedSecret>> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if entry.fetched_at.elapsed() > self.max_age {
            return None;
        }
        Some(entry.secrets.clone())
    }

    /// Clone out the cached records regardless of age. Change detection
    /// compares against the last written content even once it is past the
    /// serving window.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<ResolvedSecret>> {
        let entries = self.entries.read().ok()?;
        entries.get(key).map(|e| e.secrets.clone())
    }

    /// Age of the cached resolution for one entry, if any.
    #[must_use]
    pub fn age(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().ok()?;
        entries.get(key).map(|e| e.fetched_at.elapsed())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(uid: &str) -> ResolvedSecret {
        ResolvedSecret {
            uid: uid.to_string(),
            title: uid.to_string(),
            record_type: "login".to_string(),
            notes: None,
            fields: BTreeMap::new(),
            custom_fields: BTreeMap::new(),
            files: Vec::new(),
            attachment: None,
        }
    }

    #[test]
    fn test_round_trip_within_max_age() {
        let cache = ResolutionCache::new(Duration::from_secs(60));
        cache.put("secret/0", vec![record("AAAAAAAAAAAAAAAAAAAAAA")]);

        let got = cache.get_fresh("secret/0").expect("fresh entry");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].uid, "AAAAAAAAAAAAAAAAAAAAAA");
        assert!(cache.get_fresh("secret/1").is_none());
    }

    #[test]
    fn test_expired_entries_are_withheld() {
        let cache = ResolutionCache::new(Duration::ZERO);
        cache.put("secret/0", vec![record("AAAAAAAAAAAAAAAAAAAAAA")]);

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_fresh("secret/0").is_none());
        assert!(cache.age("secret/0").is_some(), "age still reports");
    }

    #[test]
    fn test_put_replaces_wholesale() {
        let cache = ResolutionCache::new(Duration::from_secs(60));
        cache.put(
            "folder/0",
            vec![record("AAAAAAAAAAAAAAAAAAAAAA"), record("BBBBBBBBBBBBBBBBBBBBBB")],
        );
        cache.put("folder/0", vec![record("CCCCCCCCCCCCCCCCCCCCCC")]);

        let got = cache.get_fresh("folder/0").expect("fresh entry");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].uid, "CCCCCCCCCCCCCCCCCCCCCC");
        assert_eq!(cache.len(), 1);
    }
}
