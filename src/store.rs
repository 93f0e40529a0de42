//! Local BEP44 immutable + mutable item storage with token authorization,
//! grounded on `original_source/src/bittorrent/dht.cpp`'s `_data_store` put
//! handling (seq/cas rules) and `src/cache/bep44_db.cpp`.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::id::Id;
use crate::mutable_item::{ImmutableItem, MutableItem};
use crate::token::TokenManager;
use crate::{Error, Result};

const PURGE_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Absolute cap on distinct stored items per kind, independent of
/// [PURGE_AGE], so an attacker can't grow this node's memory by putting an
/// unbounded number of items faster than they age out.
const MAX_STORED_ITEMS: usize = 50_000;

struct Stored<T> {
    item: T,
    stored_at: Instant,
}

/// Local storage backing BEP44 `get`/`put`. Bounded to [MAX_STORED_ITEMS]
/// entries per kind, evicting least-recently-used once full.
pub struct DataStore {
    immutable: LruCache<Id, Stored<ImmutableItem>>,
    mutable: LruCache<Id, Stored<MutableItem>>,
    tokens: TokenManager,
}

impl DataStore {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_STORED_ITEMS).unwrap();
        Self {
            immutable: LruCache::new(cap),
            mutable: LruCache::new(cap),
            tokens: TokenManager::new(),
        }
    }

    pub fn generate_token(&self, peer_ip: IpAddr, target: Id) -> Vec<u8> {
        self.tokens.generate(peer_ip, target)
    }

    pub fn verify_token(&self, peer_ip: IpAddr, target: Id, token: &[u8]) -> bool {
        self.tokens.verify(peer_ip, target, token)
    }

    pub fn tick(&mut self) {
        self.tokens.maybe_rotate();
        self.purge();
    }

    fn purge(&mut self) {
        let now = Instant::now();
        purge_expired(&mut self.immutable, now);
        purge_expired(&mut self.mutable, now);
    }

    /// Store an immutable item, keyed by `sha1(bencode(value))`. Duplicate
    /// puts simply overwrite (spec.md §4.4).
    pub fn put_immutable(&mut self, item: ImmutableItem) -> Id {
        let target = item.target();
        self.immutable.put(
            target,
            Stored {
                item,
                stored_at: Instant::now(),
            },
        );
        target
    }

    pub fn get_immutable(&self, target: &Id) -> Option<&ImmutableItem> {
        self.immutable.peek(target).map(|s| &s.item)
    }

    /// Apply BEP44 seq/cas rules and store `item` if accepted.
    pub fn put_mutable(&mut self, item: MutableItem, cas: Option<i64>) -> Result<()> {
        item.verify()?;

        let target = item.target();

        if let Some(existing) = self.mutable.peek(&target) {
            let existing_seq = existing.item.seq;

            if let Some(cas) = cas {
                if cas != existing_seq {
                    return Err(Error::CasMismatch);
                }
            }

            if item.seq < existing_seq {
                return Err(Error::SequenceNotUpdated);
            }
            if item.seq == existing_seq && item.value != existing.item.value {
                return Err(Error::SequenceNotUpdated);
            }
        }

        self.mutable.put(
            target,
            Stored {
                item,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn get_mutable(&self, target: &Id) -> Option<&MutableItem> {
        self.mutable.peek(target).map(|s| &s.item)
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn purge_expired<T>(cache: &mut LruCache<Id, Stored<T>>, now: Instant) {
    let expired: Vec<Id> = cache
        .iter()
        .filter(|(_, s)| now.saturating_duration_since(s.stored_at) >= PURGE_AGE)
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        cache.pop(&id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn immutable_put_get() {
        let mut store = DataStore::new();
        let item = ImmutableItem::new(b"5:hello".to_vec());
        let target = store.put_immutable(item.clone());
        assert_eq!(target, item.target());
        assert_eq!(store.get_immutable(&target).unwrap().value, item.value);
    }

    #[test]
    fn mutable_monotonicity() {
        let mut store = DataStore::new();
        let signing_key = SigningKey::generate(&mut OsRng);

        let a = MutableItem::sign(&signing_key, None, b"1:A".to_vec(), 1);
        store.put_mutable(a.clone(), None).unwrap();

        let b = MutableItem::sign(&signing_key, None, b"1:B".to_vec(), 1);
        let err = store.put_mutable(b, None).unwrap_err();
        assert!(matches!(err, Error::SequenceNotUpdated));
        assert_eq!(store.get_mutable(&a.target()).unwrap().value, a.value);

        let c = MutableItem::sign(&signing_key, None, b"1:C".to_vec(), 2);
        store.put_mutable(c.clone(), None).unwrap();
        assert_eq!(store.get_mutable(&a.target()).unwrap().value, c.value);

        let stale = MutableItem::sign(&signing_key, None, b"1:D".to_vec(), 1);
        let err = store.put_mutable(stale, None).unwrap_err();
        assert!(matches!(err, Error::SequenceNotUpdated));
        assert_eq!(store.get_mutable(&a.target()).unwrap().value, c.value);
    }

    #[test]
    fn mutable_cas_mismatch() {
        let mut store = DataStore::new();
        let signing_key = SigningKey::generate(&mut OsRng);

        let a = MutableItem::sign(&signing_key, None, b"1:A".to_vec(), 1);
        store.put_mutable(a, None).unwrap();

        let b = MutableItem::sign(&signing_key, None, b"1:B".to_vec(), 2);
        let err = store.put_mutable(b, Some(99)).unwrap_err();
        assert!(matches!(err, Error::CasMismatch));
    }
}
