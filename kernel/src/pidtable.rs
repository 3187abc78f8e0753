//! Generic fixed-bucket hash table for pid/pgid/sid lookups.
//!
//! Grounded on `original_source/include/kernel/pidHashTable.h` and
//! `.../pidHashTable.c` for the 1024-bucket chained design and page-at-a-time
//! node arena; re-expressed as one generic `PidTable<V>` (Rust generics make
//! the three copy-pasted C structs for pid/pgid/sid unnecessary) and backed
//! by [`crate::memory::pool::Pool`] for node storage rather than a
//! hand-rolled arena, since the pool already provides exactly that.

use core::ptr;
use spin::Mutex;

use crate::memory::pool::Pool;

const BUCKET_COUNT: usize = 1024;

fn hash(id: u32) -> usize {
    (id as usize) & (BUCKET_COUNT - 1)
}

struct Node<V> {
    key: u32,
    value: V,
    next: *mut Node<V>,
}

/// A PID-keyed (or PGID/SID-keyed) chained hash table. `V` is typically a
/// `Weak`-like handle (a raw process pointer, an `Arc`, or a small `Copy`
/// identifier) rather than the owning record itself.
pub struct PidTable<V> {
    buckets: Mutex<[*mut Node<V>; BUCKET_COUNT]>,
    pool: Pool,
}

unsafe impl<V: Send> Send for PidTable<V> {}
unsafe impl<V: Send> Sync for PidTable<V> {}

impl<V> PidTable<V> {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new([ptr::null_mut(); BUCKET_COUNT]),
            pool: Pool::create(core::mem::size_of::<Node<V>>() as u64, 8),
        }
    }

    /// Insert `key -> value`. Returns `false` without modifying the table
    /// if `key` is already present.
    pub fn insert(&self, key: u32, value: V) -> bool {
        let idx = hash(key);
        let mut buckets = self.buckets.lock();

        let mut cur = buckets[idx];
        while !cur.is_null() {
            unsafe {
                if (*cur).key == key {
                    return false;
                }
                cur = (*cur).next;
            }
        }

        let raw = match self.pool.allocate() {
            Some(p) => p as *mut Node<V>,
            None => return false,
        };

        unsafe {
            ptr::write(
                raw,
                Node {
                    key,
                    value,
                    next: buckets[idx],
                },
            );
        }
        buckets[idx] = raw;
        true
    }

    /// Look up `key`, cloning the stored value out.
    pub fn get(&self, key: u32) -> Option<V>
    where
        V: Clone,
    {
        let idx = hash(key);
        let buckets = self.buckets.lock();
        let mut cur = buckets[idx];
        while !cur.is_null() {
            unsafe {
                if (*cur).key == key {
                    return Some((*cur).value.clone());
                }
                cur = (*cur).next;
            }
        }
        None
    }

    /// Remove `key`, returning its value if present.
    pub fn remove(&self, key: u32) -> Option<V> {
        let idx = hash(key);
        let mut buckets = self.buckets.lock();

        let mut prev: *mut Node<V> = ptr::null_mut();
        let mut cur = buckets[idx];
        while !cur.is_null() {
            unsafe {
                if (*cur).key == key {
                    if prev.is_null() {
                        buckets[idx] = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    let node = ptr::read(cur);
                    self.pool.free(cur as *mut u8);
                    return Some(node.value);
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        None
    }

    pub fn contains(&self, key: u32) -> bool {
        let idx = hash(key);
        let buckets = self.buckets.lock();
        let mut cur = buckets[idx];
        while !cur.is_null() {
            unsafe {
                if (*cur).key == key {
                    return true;
                }
                cur = (*cur).next;
            }
        }
        false
    }
}

/// The three PID-space tables a kernel context needs: process IDs, process
/// group IDs, and session IDs. Each maps to the raw pointer/handle type its
/// owning subsystem uses.
pub struct PidTables {
    pub pids: PidTable<u64>,
    pub pgids: PidTable<u64>,
    pub sids: PidTable<u64>,
}

impl PidTables {
    pub fn new() -> Self {
        Self {
            pids: PidTable::new(),
            pgids: PidTable::new(),
            sids: PidTable::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn insert_lookup_remove_roundtrip() {
        let table: PidTable<u64> = PidTable::new();
        assert!(table.insert(42, 0xdead_beef));
        assert_eq!(table.get(42), Some(0xdead_beef));
        assert!(!table.insert(42, 0)); // duplicate rejected
        assert_eq!(table.remove(42), Some(0xdead_beef));
        assert_eq!(table.get(42), None);
    }

    #[test_case]
    fn colliding_keys_chain_correctly() {
        let table: PidTable<u64> = PidTable::new();
        let a = 5u32;
        let b = a + BUCKET_COUNT as u32; // same bucket as `a`
        assert!(table.insert(a, 1));
        assert!(table.insert(b, 2));
        assert_eq!(table.get(a), Some(1));
        assert_eq!(table.get(b), Some(2));
        assert_eq!(table.remove(a), Some(1));
        assert_eq!(table.get(b), Some(2));
    }
}
