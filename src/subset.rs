use crate::error::{PlotError, Result};
use crate::persistence::{self, DbWrite};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id of the subset holding every row. It can never be deleted.
pub const ALL_ROWS: u32 = 0;

/// Fixed-length bit-vector over dataset rows.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Mask {
    len: usize,
    words: Vec<u64>,
}

impl Mask {
    pub fn empty(len: usize) -> Self {
        Mask {
            len,
            words: vec![0; len.div_ceil(64)],
        }
    }

    pub fn full(len: usize) -> Self {
        let mut m = Mask {
            len,
            words: vec![u64::MAX; len.div_ceil(64)],
        };
        m.clear_tail();
        m
    }

    pub fn from_fn(len: usize, mut f: impl FnMut(usize) -> bool) -> Self {
        let mut m = Mask::empty(len);
        for i in 0..len {
            if f(i) {
                m.words[i / 64] |= 1 << (i % 64);
            }
        }
        m
    }

    pub fn from_bools(bools: &[bool]) -> Self {
        Mask::from_fn(bools.len(), |i| bools[i])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn set(&mut self, i: usize, value: bool) {
        if value {
            self.words[i / 64] |= 1 << (i % 64);
        } else {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn or_assign(&mut self, other: &Mask) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
    }

    pub fn and_assign(&mut self, other: &Mask) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= *b;
        }
    }

    pub fn and(&self, other: &Mask) -> Mask {
        let mut out = self.clone();
        out.and_assign(other);
        out
    }

    pub fn or(&self, other: &Mask) -> Mask {
        let mut out = self.clone();
        out.or_assign(other);
        out
    }

    /// Positions of set bits, in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            let mut bits = w;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(wi * 64 + tz)
            })
        })
    }

    pub fn to_bools(&self) -> Vec<bool> {
        (0..self.len).map(|i| self.get(i)).collect()
    }

    fn clear_tail(&mut self) {
        let rem = self.len % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Subset {
    pub mask: Mask,
    pub count: usize,
}

/// The externally visible view of a subset; the mask itself never leaves
/// the worker.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SubsetInfo {
    pub id: u32,
    pub count: usize,
}

/// Arena of row subsets for one session, keyed by small integer ids.
///
/// The store never touches durable storage. Mutations hand back a
/// [`DbWrite`] that the caller is expected to persist.
#[derive(Debug)]
pub struct SubsetStore {
    session_id: String,
    rows: usize,
    subsets: BTreeMap<u32, Subset>,
    next_id: u32,
}

impl SubsetStore {
    /// Create the store with subset 0 covering every row, merged with any
    /// subsets restored from a previous run of the session.
    pub fn new(session_id: &str, rows: usize, restored: BTreeMap<u32, Mask>) -> Self {
        let mut subsets = BTreeMap::new();
        subsets.insert(
            ALL_ROWS,
            Subset {
                mask: Mask::full(rows),
                count: rows,
            },
        );
        // Ids of dropped subsets stay reserved; their rows are still stored.
        let highest_restored = restored.keys().next_back().copied();
        for (id, mask) in restored {
            if mask.len() != rows {
                warn!(
                    "Session {}: dropping restored subset {} ({} rows, dataset has {})",
                    session_id,
                    id,
                    mask.len(),
                    rows
                );
                continue;
            }
            let count = mask.count();
            subsets.insert(id, Subset { mask, count });
        }
        let next_id = subsets
            .keys()
            .next_back()
            .copied()
            .max(highest_restored)
            .map_or(1, |max| max + 1);
        SubsetStore {
            session_id: session_id.to_string(),
            rows,
            subsets,
            next_id,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn contains(&self, id: u32) -> bool {
        self.subsets.contains_key(&id)
    }

    /// Register a new subset and return its id plus the insert to persist.
    pub fn create(&mut self, mask: Mask) -> Result<(u32, DbWrite)> {
        if mask.len() != self.rows {
            return Err(PlotError::invalid_request(format!(
                "Subset mask has {} rows, expected {}.",
                mask.len(),
                self.rows
            )));
        }
        let id = self.next_id;
        let write = persistence::insert_subset(&self.session_id, id, &mask)?;
        let count = mask.count();
        self.subsets.insert(id, Subset { mask, count });
        self.next_id += 1;
        debug!("Session {}: created subset {} ({} rows)", self.session_id, id, count);
        Ok((id, write))
    }

    pub fn delete(&mut self, id: u32) -> Result<DbWrite> {
        if id == ALL_ROWS {
            return Err(PlotError::ProtectedSubset);
        }
        if self.subsets.remove(&id).is_none() {
            return Err(PlotError::UnknownSubset(id));
        }
        Ok(persistence::delete_subset(&self.session_id, id))
    }

    pub fn export(&self, id: u32) -> Result<SubsetInfo> {
        self.subsets
            .get(&id)
            .map(|s| SubsetInfo { id, count: s.count })
            .ok_or(PlotError::UnknownSubset(id))
    }

    pub fn export_all(&self) -> BTreeMap<u32, SubsetInfo> {
        self.subsets
            .iter()
            .map(|(&id, s)| (id, SubsetInfo { id, count: s.count }))
            .collect()
    }

    pub fn mask(&self, id: u32) -> Result<&Mask> {
        self.subsets
            .get(&id)
            .map(|s| &s.mask)
            .ok_or(PlotError::UnknownSubset(id))
    }

    /// Fail with `UnknownSubset` on the first id that is not present.
    pub fn check_all(&self, ids: &[u32]) -> Result<()> {
        match ids.iter().find(|id| !self.subsets.contains_key(id)) {
            Some(&id) => Err(PlotError::UnknownSubset(id)),
            None => Ok(()),
        }
    }

    /// Bitwise OR of the requested subsets.
    pub fn union(&self, ids: &[u32]) -> Result<Mask> {
        self.check_all(ids)?;
        let mut out = Mask::empty(self.rows);
        for id in ids {
            out.or_assign(&self.subsets[id].mask);
        }
        Ok(out)
    }
}
