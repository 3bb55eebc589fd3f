use std::sync::{Arc, Mutex};

use everstore_common::CasCounter;

use crate::item::Item;
use crate::stored_value::{MutationType, StoredValue};

/// Bucket and stripe counts are prime so the modulus chain distributes
/// evenly.
pub const DEFAULT_BUCKETS: usize = 196_613;
pub const DEFAULT_STRIPES: usize = 193;

struct Stripe {
    buckets: Vec<Vec<StoredValue>>,
}

/// An open-chained hash table with lock striping.
///
/// `n_buckets` chains are guarded by a smaller set of stripe mutexes;
/// bucket `b` belongs to stripe `b % stripes`. Every mutation of a bucket
/// happens with its stripe held, which makes per-key operations
/// linearizable.
pub struct HashTable {
    n_buckets: usize,
    stripes: Vec<Mutex<Stripe>>,
    cas: Arc<CasCounter>,
}

impl HashTable {
    pub fn new(cas: Arc<CasCounter>) -> Self {
        Self::with_size(DEFAULT_BUCKETS, DEFAULT_STRIPES, cas)
    }

    pub fn with_size(n_buckets: usize, n_stripes: usize, cas: Arc<CasCounter>) -> Self {
        assert!(n_buckets > 0 && n_stripes > 0);
        let stripes = (0..n_stripes)
            .map(|stripe| {
                let buckets = n_buckets / n_stripes + usize::from(stripe < n_buckets % n_stripes);
                Mutex::new(Stripe {
                    buckets: (0..buckets).map(|_| Vec::new()).collect(),
                })
            })
            .collect();
        Self {
            n_buckets,
            stripes,
            cas,
        }
    }

    /// DJB2-xor bucket selection.
    pub fn bucket(&self, key: &str) -> usize {
        let mut h: i32 = 5381;
        for &byte in key.as_bytes() {
            h = (h << 5).wrapping_add(h) ^ i32::from(byte);
        }
        h.unsigned_abs() as usize % self.n_buckets
    }

    /// Run `f` on the entry for `key` (or `None`) with the key's stripe
    /// held, so the closure may mutate the entry in place.
    pub fn with_value<R>(&self, key: &str, f: impl FnOnce(Option<&mut StoredValue>) -> R) -> R {
        let bucket = self.bucket(key);
        let (stripe, index) = self.locate(bucket);
        let mut guard = self.stripes[stripe].lock().unwrap();
        f(guard.buckets[index].iter_mut().find(|v| v.item().key() == key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.with_value(key, |value| value.is_some())
    }

    /// Store `item`, stamping it with a fresh CAS on success. The CAS rules:
    /// a locked entry rejects any caller not presenting the holder's CAS; a
    /// non-zero request CAS must match the stored CAS exactly.
    pub fn set(&self, item: &mut Item, now: u64) -> MutationType {
        let bucket = self.bucket(item.key());
        let (stripe, index) = self.locate(bucket);
        let mut guard = self.stripes[stripe].lock().unwrap();
        let chain = &mut guard.buckets[index];

        match chain.iter_mut().find(|v| v.item().key() == item.key()) {
            Some(existing) => {
                if existing.is_locked(now) && item.cas() != existing.item().cas() {
                    return MutationType::IsLocked;
                }
                if item.cas() != 0 && item.cas() != existing.item().cas() {
                    return MutationType::InvalidCas;
                }
                item.set_cas(self.cas.next());
                let prior = if existing.is_clean() {
                    MutationType::WasClean
                } else {
                    MutationType::WasDirty
                };
                existing.replace_item(item.clone(), now);
                prior
            }
            None => {
                if item.cas() != 0 {
                    return MutationType::InvalidCas;
                }
                item.set_cas(self.cas.next());
                chain.push(StoredValue::new(item.clone(), now, true));
                MutationType::NotFound
            }
        }
    }

    /// Insert only if the key is absent; stamps a fresh CAS on success.
    pub fn add(&self, item: &mut Item, dirty: bool, now: u64) -> bool {
        let bucket = self.bucket(item.key());
        let (stripe, index) = self.locate(bucket);
        let mut guard = self.stripes[stripe].lock().unwrap();
        let chain = &mut guard.buckets[index];

        if chain.iter().any(|v| v.item().key() == item.key()) {
            return false;
        }
        item.set_cas(self.cas.next());
        chain.push(StoredValue::new(item.clone(), now, dirty));
        true
    }

    /// Remove the key; reports whether it existed.
    pub fn del(&self, key: &str) -> bool {
        let bucket = self.bucket(key);
        let (stripe, index) = self.locate(bucket);
        let mut guard = self.stripes[stripe].lock().unwrap();
        let chain = &mut guard.buckets[index];

        match chain.iter().position(|v| v.item().key() == key) {
            Some(position) => {
                chain.swap_remove(position);
                true
            }
            None => false,
        }
    }

    /// Apply `f` to every entry, one stripe at a time. No entry is observed
    /// twice; there is no atomicity across stripes.
    pub fn visit<F: FnMut(&StoredValue)>(&self, mut f: F) {
        for stripe in &self.stripes {
            let guard = stripe.lock().unwrap();
            for chain in &guard.buckets {
                for value in chain {
                    f(value);
                }
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for stripe in &self.stripes {
            let mut guard = stripe.lock().unwrap();
            for chain in &mut guard.buckets {
                chain.clear();
            }
        }
    }

    fn locate(&self, bucket: usize) -> (usize, usize) {
        (bucket % self.stripes.len(), bucket / self.stripes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn table() -> HashTable {
        HashTable::with_size(769, 7, Arc::new(CasCounter::new(1)))
    }

    #[test]
    fn set_then_find() {
        let table = table();
        let mut item = Item::new("key", b"value", 7, 0);
        assert_eq!(table.set(&mut item, 10), MutationType::NotFound);
        assert!(item.cas() > 0);
        table.with_value("key", |value| {
            let value = value.expect("entry should exist");
            assert_eq!(value.item().data(), b"value\r\n");
            assert_eq!(value.item().flags(), 7);
            assert!(value.is_dirty());
        });
    }

    #[test]
    fn second_set_reports_prior_dirtiness() {
        let table = table();
        let mut item = Item::new("key", b"v1", 0, 0);
        table.set(&mut item, 10);
        let mut update = Item::new("key", b"v2", 0, 0);
        assert_eq!(table.set(&mut update, 11), MutationType::WasDirty);
        table.with_value("key", |value| {
            value.unwrap().mark_clean();
        });
        let mut update = Item::new("key", b"v3", 0, 0);
        assert_eq!(table.set(&mut update, 12), MutationType::WasClean);
    }

    #[test]
    fn cas_must_match_exactly() {
        let table = table();
        let mut item = Item::new("key", b"v1", 0, 0);
        table.set(&mut item, 10);
        let good_cas = item.cas();

        let mut stale = Item::new("key", b"v2", 0, 0);
        stale.set_cas(good_cas + 1);
        assert_eq!(table.set(&mut stale, 11), MutationType::InvalidCas);
        table.with_value("key", |value| {
            assert_eq!(value.unwrap().item().data(), b"v1\r\n");
        });

        let mut fresh = Item::new("key", b"v2", 0, 0);
        fresh.set_cas(good_cas);
        assert_eq!(table.set(&mut fresh, 11), MutationType::WasDirty);
        assert!(fresh.cas() > good_cas);
    }

    #[test]
    fn cas_against_absent_key_is_rejected() {
        let table = table();
        let mut item = Item::new("missing", b"v", 0, 0);
        item.set_cas(99);
        assert_eq!(table.set(&mut item, 10), MutationType::InvalidCas);
        assert!(!table.contains("missing"));
    }

    #[test]
    fn locked_entry_rejects_non_holders() {
        let table = table();
        let mut item = Item::new("key", b"v1", 0, 0);
        table.set(&mut item, 10);
        let holder_cas = item.cas();
        table.with_value("key", |value| value.unwrap().lock(20));

        let mut intruder = Item::new("key", b"v2", 0, 0);
        assert_eq!(table.set(&mut intruder, 15), MutationType::IsLocked);

        let mut holder = Item::new("key", b"v2", 0, 0);
        holder.set_cas(holder_cas);
        assert_eq!(table.set(&mut holder, 15), MutationType::WasDirty);
        // A successful mutation releases the lock.
        table.with_value("key", |value| assert!(!value.unwrap().is_locked(15)));
    }

    #[test]
    fn lock_expiry_reopens_the_entry() {
        let table = table();
        let mut item = Item::new("key", b"v1", 0, 0);
        table.set(&mut item, 10);
        table.with_value("key", |value| value.unwrap().lock(20));

        let mut late = Item::new("key", b"v2", 0, 0);
        assert_eq!(table.set(&mut late, 25), MutationType::WasDirty);
    }

    #[test]
    fn add_inserts_only_when_absent() {
        let table = table();
        let mut item = Item::new("key", b"v1", 0, 0);
        assert!(table.add(&mut item, true, 10));
        let mut duplicate = Item::new("key", b"v2", 0, 0);
        assert!(!table.add(&mut duplicate, true, 10));
        table.with_value("key", |value| {
            assert_eq!(value.unwrap().item().data(), b"v1\r\n");
        });
    }

    #[test]
    fn add_clean_entries_stay_clean() {
        let table = table();
        let mut item = Item::new("key", b"v1", 0, 0);
        assert!(table.add(&mut item, false, 10));
        table.with_value("key", |value| assert!(value.unwrap().is_clean()));
    }

    #[test]
    fn del_reports_existence() {
        let table = table();
        let mut item = Item::new("key", b"v1", 0, 0);
        table.set(&mut item, 10);
        assert!(table.del("key"));
        assert!(!table.del("key"));
        assert!(!table.contains("key"));
    }

    #[test]
    fn visit_sees_each_key_exactly_once() {
        let table = table();
        for i in 0..500 {
            let mut item = Item::new(format!("key-{i}"), b"v", 0, 0);
            table.set(&mut item, 10);
        }
        let mut seen = HashSet::new();
        table.visit(|value| {
            assert!(seen.insert(value.item().key().to_string()));
        });
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn buckets_spread_uniform_keys() {
        let table = HashTable::with_size(769, 7, Arc::new(CasCounter::new(1)));
        let mut counts = vec![0usize; 769];
        for i in 0..10_000 {
            counts[table.bucket(&format!("uniform-key-{i}"))] += 1;
        }
        let max = counts.iter().copied().max().unwrap();
        // ~13 expected per bucket; a pathological hash would pile far higher.
        assert!(max < 60, "worst bucket holds {max} of 10000 keys");
    }

    #[test]
    fn clear_empties_every_bucket() {
        let table = table();
        for i in 0..50 {
            let mut item = Item::new(format!("key-{i}"), b"v", 0, 0);
            table.set(&mut item, 10);
        }
        table.clear();
        let mut count = 0;
        table.visit(|_| count += 1);
        assert_eq!(count, 0);
    }
}
