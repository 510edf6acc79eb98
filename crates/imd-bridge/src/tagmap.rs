// SPDX-License-Identifier: Apache-2.0
//! Canonical tag → dense-index map.
//!
//! Rank 0 collects every in-group particle tag, sorts the list, and assigns
//! each tag its rank in the sorted order. The assignment is therefore a pure
//! function of the tag *set*: it does not depend on how particles are
//! distributed across ranks, so frame byte layout is reproducible across
//! runs and rank counts.
//!
//! The table is a fixed-function integer hash: power-of-two bucket count,
//! multiplicative hashing with a downshift, rebuild at load factor 0.5, and
//! duplicate-rejecting insert. Linear probing replaces the original's
//! chained nodes; neither is observable through the interface.

/// Multiplier of the bucket hash function.
const HASH_MULT: i64 = 1_103_515_249;

/// Rebuild threshold: entries ≥ size / 2.
const HASH_LIMIT_NUM: usize = 1;
const HASH_LIMIT_DEN: usize = 2;

/// Dense map from particle tag to frame index.
#[derive(Debug, Clone)]
pub struct TagIndex {
    slots: Vec<Option<(i64, i64)>>,
    mask: i64,
    downshift: u32,
    entries: usize,
}

impl TagIndex {
    /// Creates a table sized for at least `buckets` entries.
    #[must_use]
    pub fn with_capacity(buckets: usize) -> Self {
        let buckets = if buckets == 0 { 16 } else { buckets };
        let mut size: usize = 2;
        let mut mask: i64 = 1;
        let mut downshift: u32 = 29;
        while size < buckets {
            size <<= 1;
            mask = (mask << 1) + 1;
            downshift -= 1;
        }
        Self {
            slots: vec![None; size],
            mask,
            downshift,
            entries: 0,
        }
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    /// True if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn bucket(&self, key: i64) -> usize {
        let h = (key.wrapping_mul(HASH_MULT) >> self.downshift) & self.mask;
        usize::try_from(h).unwrap_or(0)
    }

    /// Looks up the dense index stored for `key`.
    #[must_use]
    pub fn lookup(&self, key: i64) -> Option<i64> {
        let mut i = self.bucket(key);
        loop {
            match self.slots[i] {
                None => return None,
                Some((k, v)) if k == key => return Some(v),
                Some(_) => i = (i + 1) & (self.slots.len() - 1),
            }
        }
    }

    /// Inserts `key → value`.
    ///
    /// Duplicates are rejected: if `key` is already present its stored value
    /// is returned and the table is unchanged; a fresh insertion returns
    /// `None`.
    pub fn insert(&mut self, key: i64, value: i64) -> Option<i64> {
        if let Some(existing) = self.lookup(key) {
            return Some(existing);
        }
        while self.entries >= self.slots.len() * HASH_LIMIT_NUM / HASH_LIMIT_DEN {
            self.rebuild();
        }
        let mut i = self.bucket(key);
        while self.slots[i].is_some() {
            i = (i + 1) & (self.slots.len() - 1);
        }
        self.slots[i] = Some((key, value));
        self.entries += 1;
        None
    }

    /// Doubles the table and rehashes every entry.
    fn rebuild(&mut self) {
        let old = std::mem::take(&mut self.slots);
        let size = old.len() << 1;
        self.slots = vec![None; size];
        self.mask = (self.mask << 1) + 1;
        self.downshift -= 1;
        self.entries = 0;
        for (key, value) in old.into_iter().flatten() {
            let mut i = self.bucket(key);
            while self.slots[i].is_some() {
                i = (i + 1) & (size - 1);
            }
            self.slots[i] = Some((key, value));
            self.entries += 1;
        }
    }

    /// Produces the reverse map: `keys()[v] == k` for every stored `(k, v)`.
    ///
    /// Stored values must form the dense range `0..len()`, which is how the
    /// bridge populates the table.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        let mut keys = vec![0i64; self.entries];
        for (k, v) in self.slots.iter().flatten() {
            if let Ok(i) = usize::try_from(*v) {
                if i < keys.len() {
                    keys[i] = *k;
                }
            }
        }
        keys
    }
}

/// Sorts a tag list ascending in place.
///
/// First-element pivot with a Hoare-style partition, matching the map
/// builder's historical ordering exactly (stable tie behavior is irrelevant:
/// tags are unique).
pub fn id_sort(ids: &mut [i64]) {
    if ids.len() > 1 {
        sort_range(ids, 0, ids.len() as isize - 1);
    }
}

fn sort_range(ids: &mut [i64], mut left: isize, mut right: isize) {
    let l_hold = left;
    let r_hold = right;
    let mut pivot = ids[left as usize];

    while left < right {
        while ids[right as usize] >= pivot && left < right {
            right -= 1;
        }
        if left != right {
            ids[left as usize] = ids[right as usize];
            left += 1;
        }
        while ids[left as usize] <= pivot && left < right {
            left += 1;
        }
        if left != right {
            ids[right as usize] = ids[left as usize];
            right -= 1;
        }
    }
    ids[left as usize] = pivot;
    let pivot_pos = left;
    left = l_hold;
    right = r_hold;

    if left < pivot_pos {
        sort_range(ids, left, pivot_pos - 1);
    }
    if right > pivot_pos {
        sort_range(ids, pivot_pos + 1, right);
    }
}
