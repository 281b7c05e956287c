//! Versioned, expiring storage of values per key.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;

use crate::common::Id;

/// Default maximum number of keys to store values for.
pub const MAX_KEYS: usize = 1000;
/// Maximum number of distinct values kept per key.
pub const MAX_VALUES_PER_KEY: usize = 32;
/// Base age after which a stored value expires.
pub const MAX_ENTRY_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    owner: Option<Id>,
    version: u64,
    inserted_at: Instant,
    max_age: Duration,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.max_age
    }
}

#[derive(Debug)]
pub struct Storage {
    // Entries per key, oldest first.
    values: LruCache<Id, Vec<Entry>>,
}

impl Storage {
    pub fn new(max_keys: usize) -> Self {
        Self {
            values: LruCache::new(NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Number of keys with at least one value, expired or not.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Store `value` under `key`.
    ///
    /// Owned values replace the previous value of the same owner, unless
    /// it has an equal or higher version. Anonymous values are deduplicated.
    ///
    /// Returns `false` if the value was rejected as stale.
    pub(crate) fn put_at(
        &mut self,
        key: Id,
        value: Bytes,
        owner: Option<Id>,
        version: u64,
        max_age: Duration,
        now: Instant,
    ) -> bool {
        let entries = self.values.get_or_insert_mut(key, Vec::new);

        let existing = match owner {
            Some(owner) => entries.iter().position(|e| e.owner == Some(owner)),
            None => entries
                .iter()
                .position(|e| e.owner.is_none() && e.value == value),
        };

        if let Some(index) = existing {
            if owner.is_some() && entries[index].version >= version {
                return false;
            }

            entries.remove(index);
        }

        entries.push(Entry {
            value,
            owner,
            version,
            inserted_at: now,
            max_age,
        });

        if entries.len() > MAX_VALUES_PER_KEY {
            let oldest = entries
                .iter()
                .position(|e| e.owner.is_none())
                .unwrap_or(0);

            entries.remove(oldest);
        }

        true
    }

    /// Returns up to `limit` values of `key` that did not expire yet, skipping
    /// the first `start`.
    ///
    /// Values owned by the key itself come first, then newest first.
    pub(crate) fn get_at(&mut self, key: &Id, start: usize, limit: usize, now: Instant) -> Vec<Bytes> {
        let Some(entries) = self.values.get(key) else {
            return vec![];
        };

        let mut live: Vec<&Entry> = entries.iter().filter(|e| !e.is_expired(now)).collect();

        live.reverse();
        // Stable, so newest first among each group.
        live.sort_by_key(|e| e.owner.as_ref() != Some(key));

        live.into_iter()
            .skip(start)
            .take(limit)
            .map(|e| e.value.clone())
            .collect()
    }

    /// Physically remove expired values, and keys left without values.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&mut self, now: Instant) {
        let mut empty = vec![];

        for (key, entries) in self.values.iter_mut() {
            entries.retain(|e| !e.is_expired(now));

            if entries.is_empty() {
                empty.push(*key);
            }
        }

        for key in empty {
            self.values.pop(&key);
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new(MAX_KEYS)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn higher_version_wins() {
        let mut storage = Storage::default();
        let now = Instant::now();

        let key = Id::random();
        let owner = Id::random();

        assert!(storage.put_at(key, "v5".into(), Some(owner), 5, HOUR, now));
        assert!(!storage.put_at(key, "v3".into(), Some(owner), 3, HOUR, now));
        assert!(!storage.put_at(key, "v5 again".into(), Some(owner), 5, HOUR, now));

        assert_eq!(storage.get_at(&key, 0, 10, now), vec![Bytes::from("v5")]);

        let key = Id::random();

        assert!(storage.put_at(key, "v3".into(), Some(owner), 3, HOUR, now));
        assert!(storage.put_at(key, "v5".into(), Some(owner), 5, HOUR, now));

        assert_eq!(storage.get_at(&key, 0, 10, now), vec![Bytes::from("v5")]);
    }

    #[test]
    fn owners_are_independent() {
        let mut storage = Storage::default();
        let now = Instant::now();

        let key = Id::random();

        storage.put_at(key, "a".into(), Some(Id::random()), 1, HOUR, now);
        storage.put_at(key, "b".into(), Some(Id::random()), 1, HOUR, now);
        storage.put_at(key, "c".into(), None, 0, HOUR, now);
        storage.put_at(key, "c".into(), None, 0, HOUR, now);

        assert_eq!(
            storage.get_at(&key, 0, 10, now),
            vec![Bytes::from("c"), Bytes::from("b"), Bytes::from("a")]
        );
    }

    #[test]
    fn key_owner_comes_first() {
        let mut storage = Storage::default();
        let now = Instant::now();

        let owner = Id::random();

        storage.put_at(owner, "own".into(), Some(owner), 1, HOUR, now);
        storage.put_at(owner, "other".into(), None, 0, HOUR, now);

        assert_eq!(
            storage.get_at(&owner, 0, 10, now),
            vec![Bytes::from("own"), Bytes::from("other")]
        );
    }

    #[test]
    fn anonymous_values_are_fifo() {
        let mut storage = Storage::default();
        let now = Instant::now();

        let key = Id::random();
        let owner = Id::random();

        storage.put_at(key, "owned".into(), Some(owner), 1, HOUR, now);

        for i in 0..MAX_VALUES_PER_KEY {
            storage.put_at(key, i.to_string().into(), None, 0, HOUR, now);
        }

        let values = storage.get_at(&key, 0, 100, now);

        assert_eq!(values.len(), MAX_VALUES_PER_KEY);
        assert!(values.contains(&Bytes::from("owned")));
        assert!(!values.contains(&Bytes::from("0")));
        assert!(values.contains(&Bytes::from("1")));
    }

    #[test]
    fn expired_values_are_hidden_then_swept() {
        let mut storage = Storage::default();
        let now = Instant::now();

        let key = Id::random();

        storage.put_at(key, "short".into(), None, 0, Duration::from_secs(60), now);
        storage.put_at(key, "long".into(), None, 0, HOUR, now);

        let later = now + Duration::from_secs(61);

        assert_eq!(storage.get_at(&key, 0, 10, later), vec![Bytes::from("long")]);

        storage.sweep_at(now + HOUR * 2);
        assert!(storage.is_empty());
    }

    #[test]
    fn pagination() {
        let mut storage = Storage::default();
        let now = Instant::now();

        let key = Id::random();

        for i in 0..10 {
            storage.put_at(key, i.to_string().into(), None, 0, HOUR, now);
        }

        assert_eq!(
            storage.get_at(&key, 8, 8, now),
            vec![Bytes::from("1"), Bytes::from("0")]
        );
        assert_eq!(storage.get_at(&key, 0, 2, now).len(), 2);
        assert!(storage.get_at(&key, 10, 8, now).is_empty());
        assert!(storage.get_at(&Id::random(), 0, 8, now).is_empty());
    }
}
