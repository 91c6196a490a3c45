//! The string dedup table: a bucketed interner keyed by a 64-bit
//! mixing hash. Reference counts are not incremental; they're
//! recomputed wholesale by the GC each collection cycle (see
//! `heap.rs::Heap::collect`).

use crate::value::StringRef;

/// A `MurmurOAAT64`-style mixing seed, fixed so two independent runs
/// intern the same text to the same hash (useful for golden bytecode
/// comparisons across runs).
const HASH_SEED: u64 = 525_201_411_107_845_655;

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = HASH_SEED;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x5bd1_e995_5bd1_e995);
        h ^= h >> 47;
    }
    h
}

struct Entry {
    hash: u64,
    text: Box<[u8]>,
    refcount: u32,
}

enum Slot {
    Occupied(Entry),
    Tombstone,
}

pub struct Interner {
    buckets: Vec<Vec<Slot>>,
}

impl Interner {
    pub fn new(table_size: u16) -> Self {
        let table_size = table_size.max(1) as usize;
        Interner { buckets: (0..table_size).map(|_| Vec::new()).collect() }
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    /// Intern `bytes`, returning the `StringRef` that locates it. A
    /// byte sequence with a live entry is reused (word equality of the
    /// resulting `Value` then implies content equality); a hash match
    /// always gets a full byte-equality check rather than trusting the
    /// hash alone.
    pub fn intern(&mut self, bytes: &[u8]) -> StringRef {
        let hash = hash_bytes(bytes);
        let bucket_index = self.bucket_of(hash);
        let bucket = &mut self.buckets[bucket_index];

        for (slot_index, slot) in bucket.iter().enumerate() {
            if let Slot::Occupied(entry) = slot {
                if entry.hash == hash && &*entry.text == bytes {
                    return StringRef { bucket: bucket_index as u32, slot: slot_index as u32 };
                }
            }
        }

        let new_entry = Entry { hash, text: bytes.to_vec().into_boxed_slice(), refcount: 0 };
        for (slot_index, slot) in bucket.iter_mut().enumerate() {
            if matches!(slot, Slot::Tombstone) {
                *slot = Slot::Occupied(new_entry);
                return StringRef { bucket: bucket_index as u32, slot: slot_index as u32 };
            }
        }
        bucket.push(Slot::Occupied(new_entry));
        StringRef { bucket: bucket_index as u32, slot: (bucket.len() - 1) as u32 }
    }

    pub fn get(&self, r: StringRef) -> &[u8] {
        match self
            .buckets
            .get(r.bucket as usize)
            .and_then(|b| b.get(r.slot as usize))
        {
            Some(Slot::Occupied(entry)) => &entry.text,
            _ => &[],
        }
    }

    /// Reset every entry's refcount to zero. Called at the start of a
    /// collection cycle before roots are traced.
    pub fn clear_refcounts(&mut self) {
        for bucket in &mut self.buckets {
            for slot in bucket.iter_mut() {
                if let Slot::Occupied(entry) = slot {
                    entry.refcount = 0;
                }
            }
        }
    }

    /// Bump the refcount for a reachable string. Called once per
    /// distinct reachable string reference found while tracing roots.
    pub fn mark_reachable(&mut self, r: StringRef) {
        if let Some(Slot::Occupied(entry)) =
            self.buckets.get_mut(r.bucket as usize).and_then(|b| b.get_mut(r.slot as usize))
        {
            entry.refcount += 1;
        }
    }

    /// Reclaim every entry whose refcount is still zero after tracing.
    /// Returns the number of strings freed.
    pub fn sweep_unreferenced(&mut self) -> u32 {
        let mut freed = 0;
        for bucket in &mut self.buckets {
            for slot in bucket.iter_mut() {
                if let Slot::Occupied(entry) = slot {
                    if entry.refcount == 0 {
                        *slot = Slot::Tombstone;
                        freed += 1;
                    }
                }
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_bytes_twice_yields_the_same_ref() {
        let mut interner = Interner::new(64);
        let a = interner.intern(b"hello");
        let b = interner.intern(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_strings_get_distinct_refs() {
        let mut interner = Interner::new(64);
        let a = interner.intern(b"hello");
        let b = interner.intern(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn get_round_trips_the_original_bytes() {
        let mut interner = Interner::new(64);
        let r = interner.intern(b"round trip me");
        assert_eq!(interner.get(r), b"round trip me");
    }

    #[test]
    fn sweep_reclaims_only_unmarked_entries_and_frees_the_slot_for_reuse() {
        let mut interner = Interner::new(64);
        let a = interner.intern(b"kept");
        let _b = interner.intern(b"dropped");

        interner.clear_refcounts();
        interner.mark_reachable(a);
        let freed = interner.sweep_unreferenced();
        assert_eq!(freed, 1);
        assert_eq!(interner.get(a), b"kept");

        // Re-interning new text can reuse the tombstoned slot.
        let c = interner.intern(b"fresh");
        assert_eq!(interner.get(c), b"fresh");
    }

    #[test]
    fn interning_arbitrary_bytes_always_round_trips() {
        use proptest::prelude::*;

        proptest!(|(text in ".{0,64}")| {
            let mut interner = Interner::new(64);
            let r = interner.intern(text.as_bytes());
            prop_assert_eq!(interner.get(r), text.as_bytes());
            // Interning it again must hand back the same slot.
            let r2 = interner.intern(text.as_bytes());
            prop_assert_eq!(r, r2);
        });
    }
}
