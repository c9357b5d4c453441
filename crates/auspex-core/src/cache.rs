//! Hash and signature caches.
//!
//! Both are internally synchronized LRU stores. The hash cache is keyed on
//! the stat identity of the file content; the signature cache is keyed on
//! the digest set, so a re-signed file naturally misses.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::SystemTime;

use clru::CLruCache;

use crate::codesign::Codesign;
use crate::hashes::Hashes;
use crate::sys::StatAttr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashCacheKey {
    pub dev: u64,
    pub ino: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub btime: Option<SystemTime>,
}

impl From<&StatAttr> for HashCacheKey {
    fn from(stat: &StatAttr) -> Self {
        Self {
            dev: stat.dev,
            ino: stat.ino,
            mtime: stat.mtime,
            ctime: stat.ctime,
            btime: stat.btime,
        }
    }
}

pub struct HashCache {
    inner: Mutex<CLruCache<HashCacheKey, Hashes>>,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(CLruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &HashCacheKey) -> Option<Hashes> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: HashCacheKey, hashes: Hashes) {
        self.inner.lock().unwrap().put(key, hashes);
    }
}

pub struct CsigCache {
    inner: Mutex<CLruCache<Hashes, Codesign>>,
}

impl CsigCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(CLruCache::new(capacity)),
        }
    }

    pub fn get(&self, hashes: &Hashes) -> Option<Codesign> {
        self.inner.lock().unwrap().get(hashes).cloned()
    }

    pub fn put(&self, hashes: Hashes, codesign: Codesign) {
        self.inner.lock().unwrap().put(hashes, codesign);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn key(ino: u64) -> HashCacheKey {
        HashCacheKey {
            dev: 1,
            ino,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            btime: None,
        }
    }

    #[test]
    fn hash_cache_roundtrip_and_eviction() {
        let cache = HashCache::new(2);
        let hashes = Hashes {
            sha256: Some([7u8; 32]),
            ..Default::default()
        };
        cache.put(key(1), hashes.clone());
        cache.put(key(2), hashes.clone());
        assert_eq!(cache.get(&key(1)), Some(hashes.clone()));
        // Touching key 1 makes key 2 the eviction candidate.
        cache.put(key(3), hashes.clone());
        assert_eq!(cache.get(&key(2)), None);
        assert_eq!(cache.get(&key(1)), Some(hashes));
    }

    #[test]
    fn csig_cache_keyed_on_digests() {
        let cache = CsigCache::new(4);
        let hashes = Hashes {
            sha256: Some([9u8; 32]),
            ..Default::default()
        };
        assert!(cache.get(&hashes).is_none());
        cache.put(hashes.clone(), Codesign::unsigned());
        assert_eq!(cache.get(&hashes), Some(Codesign::unsigned()));
    }
}
